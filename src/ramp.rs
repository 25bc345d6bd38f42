//! Stepped CPU ramp on top of the session controller.

use std::sync::Arc;

use tracing::{info, warn};

use crate::controller::{DrainPolicy, LoadController, SessionOrigin};
use crate::error::ControlError;
use crate::models::{LoadSettings, RampStep};
use crate::store::EngineState;

impl LoadController {
    /// Raises the ramp by one step and restarts load at the new level.
    ///
    /// Any live session is stopped first. With [`DrainPolicy::FireAndForget`]
    /// the stop and the new start happen in the same critical section; with
    /// [`DrainPolicy::Wait`] the new session starts only after the old workers
    /// have exited.
    ///
    /// Once the gate is taken the swap runs on its own task, so dropping the
    /// returned future mid-drain still leaves the new session running.
    pub async fn increment(&self) -> Result<RampStep, ControlError> {
        let gate = Arc::clone(self.gate()).lock_owned().await;
        let ctrl = self.clone();
        let swap = tokio::spawn(async move {
            let _gate = gate;
            ctrl.swap_to_next_step().await
        });
        match swap.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                warn!(error = %err, "ramp swap task cancelled");
                Err(ControlError::Interrupted)
            }
        }
    }

    /// Body of [`increment`](Self::increment). The caller holds the gate.
    async fn swap_to_next_step(&self) -> Result<RampStep, ControlError> {
        let wait_for_drain = self.engine().drain == DrainPolicy::Wait;

        let (step, retired) = self.store().mutate(|state| {
            let ramp = state.ramp;
            if ramp.current_cpu_load >= ramp.max_cpu_load {
                return Err(ControlError::RampAtMaximum {
                    current: ramp.current_cpu_load,
                    max: ramp.max_cpu_load,
                });
            }
            let current = ramp
                .current_cpu_load
                .saturating_add(ramp.increment_step)
                .min(ramp.max_cpu_load);
            state.ramp.current_cpu_load = current;

            let retired = self.deactivate(state);
            if retired.is_none() || !wait_for_drain {
                let settings = ramp_settings(state);
                self.activate(state, settings, SessionOrigin::Ramp);
            }
            Ok((
                RampStep {
                    previous: ramp.current_cpu_load,
                    current,
                    max: ramp.max_cpu_load,
                    step: ramp.increment_step,
                },
                retired,
            ))
        })?;

        if let Some(retired) = retired {
            self.retire(retired).await;
            if wait_for_drain {
                self.store().mutate(|state| {
                    if state.session.is_none() {
                        let settings = ramp_settings(state);
                        self.activate(state, settings, SessionOrigin::Ramp);
                    }
                });
            }
        }

        info!(
            previous = step.previous,
            current = step.current,
            max = step.max,
            "ramp incremented"
        );
        Ok(step)
    }

    /// Drops the ramp back to zero and stops any live session.
    pub async fn reset(&self) -> RampStep {
        let _gate = self.gate().lock().await;
        let (step, retired) = self.store().mutate(|state| {
            let ramp = state.ramp;
            state.ramp.current_cpu_load = 0;
            (
                RampStep {
                    previous: ramp.current_cpu_load,
                    current: 0,
                    max: ramp.max_cpu_load,
                    step: ramp.increment_step,
                },
                self.deactivate(state),
            )
        });
        let stopped = retired.is_some();
        if let Some(retired) = retired {
            self.retire(retired).await;
        }
        info!(previous = step.previous, stopped, "ramp reset");
        step
    }
}

/// Ramp sessions carry CPU load only and run until stopped.
fn ramp_settings(state: &EngineState) -> LoadSettings {
    LoadSettings {
        cpu_load_percent: state.ramp.current_cpu_load,
        memory_mb: 0,
        duration_sec: 0,
        ..state.settings
    }
}
