//! The single shared control block.
//!
//! Everything the controllers coordinate on lives in [`EngineState`] behind
//! one reader/writer lock. Status queries take the shared side, every
//! transition takes the exclusive side for one short critical section.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::{DynamicLoadState, LoadSettings, LoadStatus};
use crate::thread_manager::SessionHandle;

/// Blocks committed by the memory generator of one session.
#[derive(Debug, Default)]
pub struct MemoryBlocks {
    owner: Option<Uuid>,
    blocks: Vec<Vec<u8>>,
    total_bytes: u64,
}

impl MemoryBlocks {
    /// Hands the list to a new session, dropping anything left over.
    pub fn claim(&mut self, owner: Uuid) -> Vec<Vec<u8>> {
        self.owner = Some(owner);
        self.total_bytes = 0;
        std::mem::take(&mut self.blocks)
    }

    /// Appends a block if `owner` still owns the list.
    ///
    /// A stale generator (its session already stopped or superseded) gets its
    /// block back so it is freed outside the lock.
    pub fn push(&mut self, owner: Uuid, block: Vec<u8>) -> Result<(), Vec<u8>> {
        if self.owner != Some(owner) {
            return Err(block);
        }
        self.total_bytes += block.len() as u64;
        self.blocks.push(block);
        Ok(())
    }

    /// Empties the list and releases ownership. The caller drops the blocks.
    pub fn release(&mut self) -> Vec<Vec<u8>> {
        self.owner = None;
        self.total_bytes = 0;
        std::mem::take(&mut self.blocks)
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// State guarded by the store lock.
#[derive(Debug)]
pub struct EngineState {
    pub status: LoadStatus,
    /// Settings applied by the next `start`.
    pub settings: LoadSettings,
    pub ramp: DynamicLoadState,
    pub session: Option<SessionHandle>,
    pub memory: MemoryBlocks,
    /// Set when a session ended on allocation failure, cleared by the next start.
    pub fault: Option<String>,
}

/// Consistent copy of the readable parts of [`EngineState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub status: LoadStatus,
    pub settings: LoadSettings,
    pub ramp: DynamicLoadState,
    pub session: Option<Uuid>,
    pub memory_bytes: u64,
    pub fault: Option<String>,
}

#[derive(Debug)]
pub struct Store {
    state: RwLock<EngineState>,
    busy: Arc<AtomicBool>,
}

impl Store {
    pub fn new(settings: LoadSettings, ramp: DynamicLoadState) -> Self {
        let settings = settings.clamped();
        Self {
            state: RwLock::new(EngineState {
                status: LoadStatus::idle(&settings),
                settings,
                ramp,
                session: None,
                memory: MemoryBlocks::default(),
                fault: None,
            }),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs `f` under the shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(&self.state.read())
    }

    /// Runs `f` under the exclusive lock as one atomic transition.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.read(|state| Snapshot {
            status: state.status.clone(),
            settings: state.settings,
            ramp: state.ramp,
            session: state.session.as_ref().map(SessionHandle::id),
            memory_bytes: state.memory.total_bytes(),
            fault: state.fault.clone(),
        })
    }

    /// Flag polled by CPU workers on every duty cycle.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Only called from inside a `mutate` transition.
    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub(crate) fn busy_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.busy)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(LoadSettings::default(), DynamicLoadState::default())
    }
}
