//! Session controller: the Idle/Active state machine around the generators.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cpu_stress::{self, PacerFactory};
use crate::error::{AllocationError, ControlError};
use crate::lifecycle::LifecycleTimer;
use crate::memory_stress;
use crate::models::{DynamicLoadState, LoadSettings, LoadStatus, SettingsRequest};
use crate::store::{EngineState, Snapshot, Store};
use crate::thread_manager::SessionHandle;

/// What `stop` does with the old session's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DrainPolicy {
    /// Wait for every worker to exit before returning or starting a
    /// replacement session.
    #[default]
    Wait,
    /// Request cancellation only. Old CPU workers may overlap a replacement
    /// session for up to one duty period.
    FireAndForget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub cpu_workers: usize,
    pub drain: DrainPolicy,
    /// Ceiling on memory a session may commit. A larger target fails the
    /// session with [`AllocationError`] once the ceiling is hit.
    pub memory_cap_mb: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_workers: num_cpus::get(),
            drain: DrainPolicy::default(),
            memory_cap_mb: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionOrigin {
    Direct,
    Ramp,
}

impl fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOrigin::Direct => f.write_str("direct"),
            SessionOrigin::Ramp => f.write_str("ramp"),
        }
    }
}

/// A session taken out of the store, waiting to be wound down.
pub(crate) struct Retired {
    session: SessionHandle,
    blocks: Vec<Vec<u8>>,
}

/// Owns the shared store and drives every session transition.
///
/// Cloning is cheap and every clone drives the same engine. Control
/// operations are serialised by an async gate so that a drain can be awaited
/// without holding the store lock; status reads never touch the gate.
#[derive(Clone)]
pub struct LoadController {
    store: Arc<Store>,
    gate: Arc<Mutex<()>>,
    engine: EngineConfig,
    pacer: PacerFactory,
    lifecycle: Option<LifecycleTimer>,
}

impl fmt::Debug for LoadController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadController")
            .field("engine", &self.engine)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl Default for LoadController {
    fn default() -> Self {
        Self::new(
            LoadSettings::default(),
            DynamicLoadState::default(),
            EngineConfig::default(),
        )
    }
}

impl LoadController {
    pub fn new(settings: LoadSettings, ramp: DynamicLoadState, engine: EngineConfig) -> Self {
        Self {
            store: Arc::new(Store::new(settings, ramp)),
            gate: Arc::new(Mutex::new(())),
            engine,
            pacer: cpu_stress::fixed_duty_cycle(),
            lifecycle: None,
        }
    }

    /// Ramp sessions re-arm the enabled crash/shutdown timers through `timer`.
    pub fn with_lifecycle(mut self, timer: LifecycleTimer) -> Self {
        self.lifecycle = Some(timer);
        self
    }

    /// Replaces the duty-cycle strategy used by CPU workers.
    pub fn with_pacer(mut self, pacer: PacerFactory) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn engine(&self) -> EngineConfig {
        self.engine
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn gate(&self) -> &Arc<Mutex<()>> {
        &self.gate
    }

    /// Starts a session with `settings`. Rejected while a session is live.
    pub async fn start(&self, settings: LoadSettings) -> Result<Uuid, ControlError> {
        let _gate = self.gate.lock().await;
        self.store.mutate(|state| {
            if state.session.is_some() {
                return Err(ControlError::AlreadyRunning);
            }
            Ok(self.activate(state, settings, SessionOrigin::Direct))
        })
    }

    /// Starts a session with the stored settings.
    pub async fn start_configured(&self) -> Result<Uuid, ControlError> {
        let _gate = self.gate.lock().await;
        self.store.mutate(|state| {
            if state.session.is_some() {
                return Err(ControlError::AlreadyRunning);
            }
            let settings = state.settings;
            Ok(self.activate(state, settings, SessionOrigin::Direct))
        })
    }

    /// Stops the live session. Rejected when idle.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let _gate = self.gate.lock().await;
        let retired = self
            .store
            .mutate(|state| self.deactivate(state))
            .ok_or(ControlError::NotRunning)?;
        info!(session = %retired.session.id(), reason = "requested", "load stopped");
        self.retire(retired).await;
        Ok(())
    }

    /// Replaces the settings applied by the next start. A live session keeps
    /// its targets.
    pub fn reconfigure(&self, settings: LoadSettings) -> LoadSettings {
        self.reconfigure_with(|_| settings)
    }

    /// Merges a wire request into the stored settings in one transition.
    pub fn apply_settings(&self, request: &SettingsRequest) -> LoadSettings {
        self.reconfigure_with(|current| request.merge_into(current))
    }

    fn reconfigure_with(&self, f: impl FnOnce(&LoadSettings) -> LoadSettings) -> LoadSettings {
        let settings = self.store.mutate(|state| {
            let settings = f(&state.settings).clamped();
            state.settings = settings;
            if state.session.is_none() {
                state.status.crash_after_ms = settings.crash_after_ms;
                state.status.shutdown_after_ms = settings.shutdown_after_ms;
            }
            settings
        });
        info!(
            cpu_load_percent = settings.cpu_load_percent,
            memory_mb = settings.memory_mb,
            duration_sec = settings.duration_sec,
            crash_after_ms = settings.crash_after_ms,
            shutdown_after_ms = settings.shutdown_after_ms,
            "settings updated"
        );
        settings
    }

    pub fn snapshot(&self) -> LoadStatus {
        self.store.read(|state| state.status.clone())
    }

    pub fn state(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn settings(&self) -> LoadSettings {
        self.store.read(|state| state.settings)
    }

    /// Bytes currently held by the memory generator.
    pub fn allocated_bytes(&self) -> u64 {
        self.store.read(|state| state.memory.total_bytes())
    }

    /// Message of the allocation failure that ended the last session, if any.
    pub fn fault(&self) -> Option<String> {
        self.store.read(|state| state.fault.clone())
    }

    /// Records the outcome of the latest database connection test.
    pub fn set_database_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.store.mutate(|state| state.status.database_status = status);
    }

    /// Stops any live session, used on process exit.
    pub async fn halt(&self) {
        match self.stop().await {
            Ok(()) => info!("running load stopped on exit"),
            Err(_) => debug!("no load running on exit"),
        }
    }

    /// Creates a session, launches its generators and marks the engine
    /// Active, all within the caller's critical section.
    pub(crate) fn activate(
        &self,
        state: &mut EngineState,
        settings: LoadSettings,
        origin: SessionOrigin,
    ) -> Uuid {
        let settings = settings.clamped();
        let mut session = SessionHandle::new();
        let id = session.id();
        drop(state.memory.claim(id));

        if settings.cpu_load_percent > 0 {
            self.store.set_busy(true);
            let pacer = (self.pacer)(settings.cpu_load_percent);
            let handles = cpu_stress::stress_cpu(
                self.engine.cpu_workers,
                pacer,
                self.store.busy_flag(),
                session.signal(),
            );
            for (core, handle) in handles.into_iter().enumerate() {
                session.register(format!("cpu-{core}"), handle);
            }
        }

        if settings.memory_mb > 0 {
            let ctrl = self.clone();
            let signal = session.signal();
            let target_mb = settings.memory_mb;
            let cap_mb = self.engine.memory_cap_mb;
            session.register(
                "memory",
                tokio::spawn(async move {
                    let store = Arc::clone(&ctrl.store);
                    let outcome =
                        memory_stress::stress_memory(store, id, target_mb, cap_mb, signal).await;
                    if let Err(err) = outcome {
                        error!(session = %id, error = %err, "memory generator failed");
                        // The failing worker is itself drained by the stop, so
                        // the stop must run outside of it.
                        tokio::spawn(async move { ctrl.fail(id, err).await });
                    }
                }),
            );
        }

        if settings.duration_sec > 0 {
            let ctrl = self.clone();
            let mut signal = session.signal();
            let duration = Duration::from_secs(settings.duration_sec);
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal.cancelled() => {}
                    _ = sleep(duration) => ctrl.expire(id).await,
                }
            });
        }

        if origin == SessionOrigin::Ramp {
            if let Some(timer) = &self.lifecycle {
                timer.arm_for_session(id, &settings, &session.signal());
            }
        }

        state.status.running = true;
        state.status.cpu_load_percent = settings.cpu_load_percent;
        state.status.memory_mb = settings.memory_mb;
        state.status.crash_after_ms = settings.crash_after_ms;
        state.status.shutdown_after_ms = settings.shutdown_after_ms;
        state.fault = None;

        info!(
            session = %id,
            %origin,
            cpu_load_percent = settings.cpu_load_percent,
            memory_mb = settings.memory_mb,
            duration_sec = settings.duration_sec,
            workers = session.worker_count(),
            "load started"
        );
        state.session = Some(session);
        id
    }

    /// Takes the live session out of the store and marks the engine Idle.
    pub(crate) fn deactivate(&self, state: &mut EngineState) -> Option<Retired> {
        let session = state.session.take()?;
        session.cancel();
        self.store.set_busy(false);
        let blocks = state.memory.release();
        state.status.running = false;
        state.status.cpu_load_percent = 0;
        state.status.memory_mb = 0;
        Some(Retired { session, blocks })
    }

    /// Frees a retired session's memory and winds its workers down according
    /// to the drain policy. Runs outside the store lock.
    pub(crate) async fn retire(&self, retired: Retired) {
        let Retired { session, blocks } = retired;
        if !blocks.is_empty() {
            drop(blocks);
            memory_stress::release_to_os();
        }
        match self.engine.drain {
            DrainPolicy::Wait => session.drain().await,
            DrainPolicy::FireAndForget => session.detach(),
        }
    }

    /// Duration expiry. A no-op when `id` was already stopped or replaced.
    async fn expire(&self, id: Uuid) {
        let _gate = self.gate.lock().await;
        let retired = self.store.mutate(|state| {
            if state.session.as_ref().map(SessionHandle::id) != Some(id) {
                return None;
            }
            self.deactivate(state)
        });
        match retired {
            Some(retired) => {
                info!(session = %id, reason = "duration elapsed", "load stopped");
                self.retire(retired).await;
            }
            None => debug!(session = %id, "expiry found session already stopped"),
        }
    }

    /// Stops session `id` after its memory generator gave up and flags the
    /// engine with the cause.
    async fn fail(&self, id: Uuid, err: AllocationError) {
        let _gate = self.gate.lock().await;
        let retired = self.store.mutate(|state| {
            if state.session.as_ref().map(SessionHandle::id) != Some(id) {
                return None;
            }
            state.fault = Some(err.to_string());
            self.deactivate(state)
        });
        if let Some(retired) = retired {
            error!(session = %id, error = %err, reason = "resource exhaustion", "load stopped");
            self.retire(retired).await;
        }
    }
}
