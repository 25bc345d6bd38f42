//! Dynamic ramp tests
//!
//! Stepping up to the cap, reset, replacement of direct sessions and
//! status consistency under concurrent ramp traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loadsim::{
    ControlError, DrainPolicy, DynamicLoadState, EngineConfig, LifecycleTimer, LoadController,
    LoadSettings, TerminationKind, TimerConfig,
};

fn controller(drain: DrainPolicy) -> LoadController {
    LoadController::new(
        LoadSettings {
            memory_mb: 0,
            ..LoadSettings::default()
        },
        DynamicLoadState::default(),
        EngineConfig {
            cpu_workers: 1,
            drain,
            ..EngineConfig::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn increments_climb_to_cap_then_reject() {
    let ctrl = controller(DrainPolicy::Wait);
    for k in 1..=7u8 {
        let step = ctrl.increment().await.unwrap();
        assert_eq!(step.previous, (k - 1) * 10);
        assert_eq!(step.current, (k * 10).min(70));
        let status = ctrl.snapshot();
        assert!(status.running);
        assert_eq!(status.cpu_load_percent, step.current);
        assert_eq!(status.memory_mb, 0);
    }

    let err = ctrl.increment().await.unwrap_err();
    assert_eq!(err, ControlError::RampAtMaximum { current: 70, max: 70 });
    assert_eq!(ctrl.state().ramp.current_cpu_load, 70);
    assert_eq!(ctrl.snapshot().cpu_load_percent, 70);

    let step = ctrl.reset().await;
    assert_eq!(step.previous, 70);
    assert_eq!(step.current, 0);
    let status = ctrl.snapshot();
    assert!(!status.running);
    assert_eq!(status.cpu_load_percent, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn last_step_is_truncated_to_cap() {
    let ctrl = LoadController::new(
        LoadSettings::default(),
        DynamicLoadState {
            current_cpu_load: 0,
            max_cpu_load: 25,
            increment_step: 10,
        },
        EngineConfig {
            cpu_workers: 1,
            drain: DrainPolicy::FireAndForget,
            ..EngineConfig::default()
        },
    );
    ctrl.increment().await.unwrap();
    ctrl.increment().await.unwrap();
    let step = ctrl.increment().await.unwrap();
    assert_eq!((step.previous, step.current), (20, 25));
    assert!(ctrl.increment().await.is_err());
    ctrl.reset().await;
}

#[tokio::test]
async fn reset_while_idle_is_accepted() {
    let ctrl = controller(DrainPolicy::Wait);
    let step = ctrl.reset().await;
    assert_eq!(step.previous, 0);
    assert_eq!(step.max, 70);
    assert!(!ctrl.snapshot().running);
}

#[tokio::test(flavor = "multi_thread")]
async fn increment_replaces_direct_session() {
    let ctrl = controller(DrainPolicy::Wait);
    let direct = ctrl
        .start(LoadSettings {
            cpu_load_percent: 50,
            memory_mb: 2,
            ..LoadSettings::default()
        })
        .await
        .unwrap();

    ctrl.increment().await.unwrap();
    let state = ctrl.state();
    assert_ne!(state.session, Some(direct));
    assert_eq!(state.status.cpu_load_percent, 10);
    assert_eq!(state.status.memory_mb, 0);
    assert_eq!(ctrl.allocated_bytes(), 0);

    // Ramp sessions are ordinary sessions for start/stop.
    assert_eq!(ctrl.start_configured().await, Err(ControlError::AlreadyRunning));
    ctrl.stop().await.unwrap();
    assert_eq!(ctrl.state().ramp.current_cpu_load, 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_increment_still_starts_next_step() {
    let ctrl = controller(DrainPolicy::Wait);
    ctrl.increment().await.unwrap();

    // The 10% worker idles for 90ms per period, so the drain is still
    // pending when the caller gives up.
    let _ = tokio::time::timeout(Duration::from_millis(1), ctrl.increment()).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let state = ctrl.state();
        if state.status.running && state.status.cpu_load_percent == 20 {
            assert_eq!(state.ramp.current_cpu_load, 20);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ramp stuck at {:?} with status {:?}",
            state.ramp,
            state.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The gate was released with the swap, so the ramp keeps working.
    let step = ctrl.increment().await.unwrap();
    assert_eq!((step.previous, step.current), (20, 30));
    ctrl.reset().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshots_stay_consistent_during_ramp_traffic() {
    let ctrl = controller(DrainPolicy::FireAndForget);
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let ctrl = ctrl.clone();
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut observed = 0usize;
            while !done.load(Ordering::Acquire) {
                let status = ctrl.snapshot();
                if status.running {
                    assert!(status.cpu_load_percent > 0, "running with no cpu target");
                    assert_eq!(status.cpu_load_percent % 10, 0);
                } else {
                    assert_eq!(status.cpu_load_percent, 0);
                    assert_eq!(status.memory_mb, 0);
                }
                observed += 1;
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    for _ in 0..5 {
        while ctrl.increment().await.is_ok() {}
        ctrl.reset().await;
    }
    done.store(true, Ordering::Release);
    assert!(reader.await.unwrap() > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn ramp_sessions_arm_enabled_lifecycle_timers() {
    let enabled = TimerConfig {
        enabled: true,
        after_ms: 5000,
    };
    let (timer, mut rx) = LifecycleTimer::new(enabled, TimerConfig::disabled(10000));
    let ctrl = LoadController::new(
        LoadSettings {
            memory_mb: 0,
            crash_after_ms: 40,
            ..LoadSettings::default()
        },
        DynamicLoadState::default(),
        EngineConfig {
            cpu_workers: 1,
            drain: DrainPolicy::Wait,
            ..EngineConfig::default()
        },
    )
    .with_lifecycle(timer);

    ctrl.increment().await.unwrap();
    let termination = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("crash timer should fire")
        .unwrap();
    assert_eq!(termination.kind, TerminationKind::Crash);

    // A reset disarms the timers of the session it stops.
    ctrl.increment().await.unwrap();
    ctrl.reset().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}
