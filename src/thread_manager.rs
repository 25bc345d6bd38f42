use std::fmt;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Owning side of a session's cancellation scope.
///
/// Cancelling is broadcast to every [`CancelSignal`] handed out. Dropping the
/// scope cancels it as well, so a lost handle can never leave workers running.
pub struct CancelScope {
    tx: watch::Sender<bool>,
}

impl CancelScope {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Receiving side of a [`CancelScope`]. Cheap to clone, one per worker.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Non-blocking check, used by workers running on blocking threads.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the scope is cancelled or dropped.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// The live session: its id, cancellation scope and generator workers.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    scope: CancelScope,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: CancelScope::new(),
            workers: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn signal(&self) -> CancelSignal {
        self.scope.signal()
    }

    /// Tracks a generator worker so it can be drained on stop.
    pub fn register(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        debug!(
            session = %self.id,
            worker = %name,
            total = self.workers.len() + 1,
            "worker registered"
        );
        self.workers.push((name, handle));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Requests cancellation without waiting for the workers.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// Cancels and waits until every worker has returned.
    pub async fn drain(self) {
        self.scope.cancel();
        let id = self.id;
        let SessionHandle { workers, scope, .. } = self;
        for (name, handle) in workers {
            if let Err(err) = handle.await {
                warn!(session = %id, worker = %name, error = %err, "worker ended abnormally");
            }
        }
        drop(scope);
        debug!(session = %id, "session drained");
    }

    /// Cancels and lets the workers wind down on their own.
    pub fn detach(self) {
        self.scope.cancel();
        debug!(session = %self.id, workers = self.workers.len(), "session detached");
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}
