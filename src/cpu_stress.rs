use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::task::{self, JoinHandle};
use tracing::{debug, info};

use crate::thread_manager::CancelSignal;

/// Length of one busy/idle period.
pub const DUTY_PERIOD: Duration = Duration::from_millis(100);

/// One busy phase followed by one idle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycle {
    pub busy: Duration,
    pub idle: Duration,
}

/// Decides how long a CPU worker spins and sleeps on each iteration.
///
/// Workers ask for a fresh cycle every period, so an implementation that
/// measures achieved utilisation can adjust between periods.
pub trait Pacer: Send + Sync + fmt::Debug {
    fn next_cycle(&self) -> DutyCycle;
}

/// Open-loop pacer: `percent` ms busy, `100 - percent` ms idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDutyCycle {
    percent: u8,
}

impl FixedDutyCycle {
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

impl Pacer for FixedDutyCycle {
    fn next_cycle(&self) -> DutyCycle {
        let busy = Duration::from_millis(u64::from(self.percent));
        DutyCycle {
            busy,
            idle: DUTY_PERIOD.saturating_sub(busy),
        }
    }
}

/// Builds the pacer for a session's CPU target.
pub type PacerFactory = Arc<dyn Fn(u8) -> Arc<dyn Pacer> + Send + Sync>;

pub fn fixed_duty_cycle() -> PacerFactory {
    Arc::new(|percent| Arc::new(FixedDutyCycle::new(percent)) as Arc<dyn Pacer>)
}

/// Spawns `threads` blocking workers that follow `pacer` until `cancel`
/// fires or `busy` is cleared.
pub fn stress_cpu(
    threads: usize,
    pacer: Arc<dyn Pacer>,
    busy: Arc<AtomicBool>,
    cancel: CancelSignal,
) -> Vec<JoinHandle<()>> {
    info!(workers = threads, pacer = ?pacer, "starting CPU load generation");

    (0..threads)
        .map(|core| {
            let pacer = Arc::clone(&pacer);
            let busy = Arc::clone(&busy);
            let cancel = cancel.clone();
            task::spawn_blocking(move || run_worker(core, pacer.as_ref(), &busy, &cancel))
        })
        .collect()
}

fn run_worker(core: usize, pacer: &dyn Pacer, busy: &AtomicBool, cancel: &CancelSignal) {
    let mut cycles = 0u64;
    while !cancel.is_cancelled() && busy.load(Ordering::Acquire) {
        let cycle = pacer.next_cycle();
        spin_for(cycle.busy);
        if !cycle.idle.is_zero() {
            thread::sleep(cycle.idle);
        }
        cycles += 1;
    }
    debug!(core, cycles, "CPU worker stopped");
}

fn spin_for(budget: Duration) {
    let start = Instant::now();
    while start.elapsed() < budget {
        let acc = (0..1_000u64).fold(0u64, |acc, x| acc.wrapping_add(x * x));
        std::hint::black_box(acc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_manager::CancelScope;

    #[test]
    fn fixed_cycle_splits_period() {
        let cycle = FixedDutyCycle::new(30).next_cycle();
        assert_eq!(cycle.busy, Duration::from_millis(30));
        assert_eq!(cycle.idle, Duration::from_millis(70));
    }

    #[test]
    fn full_load_has_no_idle() {
        let cycle = FixedDutyCycle::new(100).next_cycle();
        assert_eq!(cycle.busy, DUTY_PERIOD);
        assert!(cycle.idle.is_zero());
        assert_eq!(FixedDutyCycle::new(250).percent(), 100);
    }

    #[tokio::test]
    async fn workers_exit_within_one_period_of_cancel() {
        let scope = CancelScope::new();
        let busy = Arc::new(AtomicBool::new(true));
        let handles = stress_cpu(2, Arc::new(FixedDutyCycle::new(20)), busy, scope.signal());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let cancelled_at = Instant::now();
        scope.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(cancelled_at.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn clearing_busy_flag_stops_workers() {
        let scope = CancelScope::new();
        let busy = Arc::new(AtomicBool::new(true));
        let handles = stress_cpu(
            1,
            Arc::new(FixedDutyCycle::new(10)),
            Arc::clone(&busy),
            scope.signal(),
        );
        busy.store(false, Ordering::Release);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker should observe the busy flag")
                .unwrap();
        }
    }
}
