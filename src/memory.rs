//! Frame buffer memory pools and the allocation policy for growing frame slots.
//!
//! The target boards have a small amount of fast internal RAM and, on some models, a
//! much larger external PSRAM. [`MemoryPools`] tracks the byte budget of each and hands
//! out [`PooledBuffer`]s; a buffer returns its bytes to the pool it came from when it
//! is dropped, so a replaced buffer is released exactly once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

use crate::{Result, StreamError};

/// Which memory pool a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Fast on-chip RAM
    Internal,
    /// Slower external (PSRAM) memory
    External,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pool::Internal => f.write_str("internal"),
            Pool::External => f.write_str("external"),
        }
    }
}

/// Byte budgets for the two pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBudget {
    /// Internal RAM available for frame buffers
    pub internal_bytes: usize,
    /// External RAM available for frame buffers, 0 when the board has none
    pub external_bytes: usize,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self { internal_bytes: 320 * 1024, external_bytes: 4 * 1024 * 1024 }
    }
}

#[derive(Debug)]
struct PoolCounter {
    capacity: usize,
    free: AtomicUsize,
}

impl PoolCounter {
    fn new(capacity: usize) -> Self {
        Self { capacity, free: AtomicUsize::new(capacity) }
    }

    fn free(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Strictly-greater check mirrors the board allocator, which keeps some headroom.
    fn try_take(&self, size: usize) -> bool {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                if free > size { Some(free - size) } else { None }
            })
            .is_ok()
    }

    fn give_back(&self, size: usize) {
        let previous = self.free.fetch_add(size, Ordering::AcqRel);
        debug_assert!(previous + size <= self.capacity, "pool released more than it lent");
    }
}

/// Accounting for the internal and optional external memory pools.
#[derive(Debug)]
pub struct MemoryPools {
    internal: PoolCounter,
    external: Option<PoolCounter>,
}

impl MemoryPools {
    /// Create pools from a budget. A zero external budget means no external memory.
    pub fn new(budget: MemoryBudget) -> Arc<Self> {
        let external = (budget.external_bytes > 0).then(|| PoolCounter::new(budget.external_bytes));
        Arc::new(Self { internal: PoolCounter::new(budget.internal_bytes), external })
    }

    /// Bytes currently free in `pool` (0 for a missing external pool).
    pub fn free(&self, pool: Pool) -> usize {
        match pool {
            Pool::Internal => self.internal.free(),
            Pool::External => self.external.as_ref().map_or(0, PoolCounter::free),
        }
    }

    /// Whether the board has external memory.
    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    fn counter(&self, pool: Pool) -> Option<&PoolCounter> {
        match pool {
            Pool::Internal => Some(&self.internal),
            Pool::External => self.external.as_ref(),
        }
    }

    /// Pool order for a request of `size` bytes.
    ///
    /// Internal memory is preferred unless the request exceeds two-thirds of what is
    /// currently free there; then external memory goes first. Either way the other pool
    /// is the fallback.
    pub fn preference(&self, size: usize) -> [Pool; 2] {
        if self.has_external() && size > self.internal.free() * 2 / 3 {
            [Pool::External, Pool::Internal]
        } else {
            [Pool::Internal, Pool::External]
        }
    }

    /// Allocate a zeroed buffer of `size` bytes following [`MemoryPools::preference`].
    ///
    /// Failing in both pools is [`StreamError::AllocationExhausted`]; the pipeline has no
    /// way to continue without a frame buffer.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<PooledBuffer> {
        for pool in self.preference(size) {
            let Some(counter) = self.counter(pool) else {
                continue;
            };
            if !counter.try_take(size) {
                trace!(%pool, size, free = counter.free(), "Pool cannot satisfy request");
                continue;
            }

            let mut data = Vec::new();
            if data.try_reserve_exact(size).is_err() {
                counter.give_back(size);
                warn!(%pool, size, "System allocator refused frame buffer");
                continue;
            }
            data.resize(size, 0);

            debug!(%pool, size, free = counter.free(), "Allocated frame buffer");
            return Ok(PooledBuffer { data, pool, pools: Arc::clone(self) });
        }

        Err(StreamError::allocation_exhausted(size))
    }
}

/// A fixed-size byte buffer charged against one of the [`MemoryPools`].
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Pool,
    pools: Arc<MemoryPools>,
}

impl PooledBuffer {
    /// Allocated size in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Pool the buffer was charged to
    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.data.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(counter) = self.pools.counter(self.pool) {
            counter.give_back(self.data.len());
        }
        trace!(pool = %self.pool, size = self.data.len(), "Released frame buffer");
    }
}

/// Capacity a slot grows to when it must hold `required` bytes.
///
/// Over-allocating by a third amortises reallocation across frames whose encoded size
/// fluctuates from one capture to the next.
pub fn grown_capacity(required: usize) -> usize {
    required.saturating_mul(4) / 3
}
