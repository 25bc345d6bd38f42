use std::collections::TryReserveError;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AllocationError;
use crate::store::Store;
use crate::thread_manager::CancelSignal;

pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// Pause between two block allocations.
pub const ALLOCATION_PAUSE: Duration = Duration::from_millis(10);

/// Commits `target_mb` of memory in 1 MiB blocks held in the store's block
/// list, then holds it until `cancel` fires.
///
/// Returns the number of bytes committed before cancellation. Blocks still
/// owned by `session` when the generator returns are released. A block that
/// cannot be allocated, or that would cross `cap_mb`, ends generation with
/// [`AllocationError::Exhausted`].
pub async fn stress_memory(
    store: Arc<Store>,
    session: Uuid,
    target_mb: u64,
    cap_mb: Option<u64>,
    mut cancel: CancelSignal,
) -> Result<u64, AllocationError> {
    let target = target_mb.saturating_mul(BLOCK_SIZE);
    let cap = cap_mb.map(|mb| mb.saturating_mul(BLOCK_SIZE));
    info!(%session, target_mb, ?cap_mb, "starting memory load generation");

    let mut allocated = 0u64;
    while allocated < target {
        if cancel.is_cancelled() {
            debug!(%session, allocated, "memory generation cancelled mid-allocation");
            release_owned(&store, session);
            return Ok(allocated);
        }

        let size = (target - allocated).min(BLOCK_SIZE);
        let exhausted = |reason: String| AllocationError::Exhausted {
            allocated_bytes: allocated,
            requested_bytes: target,
            reason,
        };
        if let Some(cap) = cap.filter(|cap| allocated + size > *cap) {
            return Err(exhausted(format!("memory cap of {cap} bytes reached")));
        }
        let block = allocate_block(size as usize).map_err(|err| exhausted(err.to_string()))?;

        if store.mutate(|state| state.memory.push(session, block)).is_err() {
            debug!(%session, "memory list claimed by another session, stopping");
            return Ok(allocated);
        }
        allocated += size;

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%session, allocated, "memory generation cancelled mid-allocation");
                release_owned(&store, session);
                return Ok(allocated);
            }
            _ = sleep(ALLOCATION_PAUSE) => {}
        }
    }

    info!(%session, allocated_mb = allocated / BLOCK_SIZE, "memory allocation completed");
    cancel.cancelled().await;
    release_owned(&store, session);
    info!(%session, "memory load generation stopped");
    Ok(allocated)
}

/// Allocates a block and writes every byte so the pages are committed.
fn allocate_block(size: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut block = Vec::new();
    block.try_reserve_exact(size)?;
    block.extend((0..size).map(|i| (i % 256) as u8));
    Ok(block)
}

fn release_owned(store: &Store, session: Uuid) {
    let blocks = store.mutate(|state| {
        if state.memory.owner() == Some(session) {
            state.memory.release()
        } else {
            Vec::new()
        }
    });
    if !blocks.is_empty() {
        drop(blocks);
        release_to_os();
    }
}

/// Asks the allocator to hand freed heap pages back to the OS.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub fn release_to_os() {
    // SAFETY: malloc_trim only walks allocator bookkeeping and may be called
    // from any thread at any time.
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub fn release_to_os() {}
