//! Double-buffered frame storage and the synchronizer that publishes it.
//!
//! Exactly two [`FrameSlot`]s exist for the lifetime of a pipeline. The acquisition
//! worker owns one of them outright and fills it; the other sits inside [`FrameSync`]
//! as the published frame. Publishing swaps the two under the synchronizer token, so the
//! slot a reader sees is never the slot being written.
//!
//! The token is held briefly by the swap and for a whole frame transmission by a reader.
//! `tokio::sync::Mutex` queues waiters in FIFO order, which bounds how long a pending
//! swap waits to one transmission.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::Result;
use crate::memory::{MemoryPools, PooledBuffer, grown_capacity};

/// One of the two capture buffers.
#[derive(Debug, Default)]
pub struct FrameSlot {
    buffer: Option<PooledBuffer>,
    len: usize,
    sequence: u64,
}

impl FrameSlot {
    /// An empty slot with no allocation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocated capacity in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, PooledBuffer::capacity)
    }

    /// Length of the frame currently held
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capture sequence number of the frame currently held (0 before the first capture)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Encoded frame bytes
    pub fn bytes(&self) -> &[u8] {
        match &self.buffer {
            Some(buffer) => &buffer.as_slice()[..self.len],
            None => &[],
        }
    }

    /// Make room for at least `required` bytes.
    ///
    /// When the slot is too small the old allocation is released first and a new one of
    /// 4/3 the required size is taken from `pools`. Returns whether the slot grew.
    pub fn reserve(&mut self, required: usize, pools: &Arc<MemoryPools>) -> Result<bool> {
        if required <= self.capacity() {
            return Ok(false);
        }

        // Free before allocating: the old buffer's bytes count towards the new request.
        self.buffer = None;
        self.len = 0;

        let capacity = grown_capacity(required);
        let buffer = pools.allocate(capacity)?;
        trace!(required, capacity, pool = %buffer.pool(), "Frame slot grown");
        self.buffer = Some(buffer);
        Ok(true)
    }

    /// Copy an encoded frame into the slot, growing it when needed.
    pub fn store(&mut self, frame: &[u8], sequence: u64, pools: &Arc<MemoryPools>) -> Result<()> {
        self.reserve(frame.len(), pools)?;
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.as_mut_slice()[..frame.len()].copy_from_slice(frame);
        }
        self.len = frame.len();
        self.sequence = sequence;
        Ok(())
    }
}

/// The synchronizer token guarding the published frame.
#[derive(Debug, Default)]
pub struct FrameSync {
    active: Mutex<FrameSlot>,
    published: AtomicU64,
}

impl FrameSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `filling` and take back the previously active slot in its place.
    ///
    /// The caller keeps ownership of exactly one slot at all times; after the swap that
    /// slot is the stale one and is safe to overwrite without holding the token.
    pub async fn publish(&self, filling: &mut FrameSlot) {
        let mut active = self.active.lock().await;
        std::mem::swap(&mut *active, filling);
        self.published.store(active.sequence(), Ordering::Release);
        trace!(sequence = active.sequence(), len = active.len(), "Frame published");
    }

    /// Borrow the published frame, holding the token until the lease is dropped.
    pub async fn lease(&self) -> FrameLease<'_> {
        FrameLease { guard: self.active.lock().await }
    }

    /// Sequence number of the most recently published frame, 0 before the first.
    pub fn published_sequence(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}

/// Read-only view of the published frame. The synchronizer token is held for the
/// lease's whole lifetime.
#[derive(Debug)]
pub struct FrameLease<'a> {
    guard: MutexGuard<'a, FrameSlot>,
}

impl FrameLease<'_> {
    pub fn bytes(&self) -> &[u8] {
        self.guard.bytes()
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.guard.sequence()
    }
}
