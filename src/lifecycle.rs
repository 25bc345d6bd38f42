//! One-shot crash and shutdown timers.
//!
//! Timers never terminate the process themselves. When one fires it sends a
//! [`Termination`] to the process owner (the binary), which carries it out.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::LoadSettings;
use crate::thread_manager::CancelSignal;

/// Upper bound on a graceful listener drain.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationKind {
    /// Abrupt abnormal exit, no cleanup.
    Crash,
    /// Listener drain, then exit code 0.
    Shutdown,
}

impl fmt::Display for TerminationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationKind::Crash => f.write_str("crash"),
            TerminationKind::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub kind: TerminationKind,
    pub reason: String,
}

/// Enabled flag plus delay. A delay of zero or less fires immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerConfig {
    pub enabled: bool,
    pub after_ms: i64,
}

impl TimerConfig {
    pub fn disabled(after_ms: i64) -> Self {
        Self {
            enabled: false,
            after_ms,
        }
    }
}

pub type TerminationReceiver = mpsc::UnboundedReceiver<Termination>;

#[derive(Debug, Clone)]
pub struct LifecycleTimer {
    crash: TimerConfig,
    shutdown: TimerConfig,
    tx: mpsc::UnboundedSender<Termination>,
}

impl LifecycleTimer {
    pub fn new(crash: TimerConfig, shutdown: TimerConfig) -> (Self, TerminationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                crash,
                shutdown,
                tx,
            },
            rx,
        )
    }

    pub fn crash(&self) -> TimerConfig {
        self.crash
    }

    pub fn shutdown(&self) -> TimerConfig {
        self.shutdown
    }

    /// Arms the process-level timers from the startup configuration.
    ///
    /// Immediate actions are sent before this returns, crash first.
    pub fn arm(&self) {
        for (kind, config, var) in [
            (TerminationKind::Crash, self.crash, "CRASH"),
            (TerminationKind::Shutdown, self.shutdown, "SHUTDOWN"),
        ] {
            if !config.enabled {
                continue;
            }
            if config.after_ms <= 0 {
                self.fire(kind, format!("{var}=true with no delay specified"));
            } else {
                info!(action = %kind, after_ms = config.after_ms, "lifecycle timer armed");
                self.schedule(
                    kind,
                    Duration::from_millis(config.after_ms as u64),
                    format!("{var}=true with {}ms delay", config.after_ms),
                    None,
                );
            }
        }
    }

    /// Re-arms the enabled timers with a session's own delays. The timers are
    /// disarmed when the session's scope is cancelled.
    pub fn arm_for_session(&self, session: Uuid, settings: &LoadSettings, cancel: &CancelSignal) {
        for (kind, enabled, after_ms) in [
            (
                TerminationKind::Crash,
                self.crash.enabled,
                settings.crash_after_ms,
            ),
            (
                TerminationKind::Shutdown,
                self.shutdown.enabled,
                settings.shutdown_after_ms,
            ),
        ] {
            if !enabled {
                continue;
            }
            info!(%session, action = %kind, after_ms, "session lifecycle timer armed");
            self.schedule(
                kind,
                Duration::from_millis(after_ms.max(0) as u64),
                format!("auto-{kind} triggered after {after_ms}ms"),
                Some(cancel.clone()),
            );
        }
    }

    /// Fires `kind` after `delay` unless `cancel` fires first.
    pub fn schedule(
        &self,
        kind: TerminationKind,
        delay: Duration,
        reason: String,
        cancel: Option<CancelSignal>,
    ) -> JoinHandle<()> {
        let timer = self.clone();
        tokio::spawn(async move {
            match cancel {
                Some(mut cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(action = %kind, "lifecycle timer disarmed");
                            return;
                        }
                        _ = sleep(delay) => {}
                    }
                }
                None => sleep(delay).await,
            }
            timer.fire(kind, reason);
        })
    }

    /// Hands a termination to the process owner right away.
    pub fn fire(&self, kind: TerminationKind, reason: impl Into<String>) {
        let reason = reason.into();
        match kind {
            TerminationKind::Crash => error!(action = %kind, %reason, "crash triggered"),
            TerminationKind::Shutdown => info!(action = %kind, %reason, "shutdown triggered"),
        }
        if self.tx.send(Termination { kind, reason }).is_err() {
            warn!(action = %kind, "no process owner is listening for terminations");
        }
    }
}
