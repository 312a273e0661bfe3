//! Packet buffers recycled between connections.
//!
//! Every [`Channel`](crate::sync::Channel) checks out one [`BufferSet`] when it
//! is created and hands it back when it is dropped, so short-lived connections
//! (including the side connections used to kill a query) reuse warm buffers.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

use crate::buffer_set::BufferSet;

const POOL_CAPACITY: usize = 128;

/// Buffers larger than this are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = 4 * 1024 * 1024;

pub static GLOBAL_BUFFER_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::default()));

/// A checked-out `BufferSet`; goes back to its pool on drop.
pub struct PooledBufferSet {
    pool: Arc<BufferPool>,
    buffers: ManuallyDrop<BufferSet>,
}

impl std::fmt::Debug for PooledBufferSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.buffers, f)
    }
}

impl Deref for PooledBufferSet {
    type Target = BufferSet;

    fn deref(&self) -> &BufferSet {
        &self.buffers
    }
}

impl DerefMut for PooledBufferSet {
    fn deref_mut(&mut self) -> &mut BufferSet {
        &mut self.buffers
    }
}

impl Drop for PooledBufferSet {
    fn drop(&mut self) {
        // SAFETY: `buffers` is not touched again after this take
        let buffers = unsafe { ManuallyDrop::take(&mut self.buffers) };
        self.pool.recycle(buffers);
    }
}

/// Lock-free pool of idle `BufferSet`s.
#[derive(Debug)]
pub struct BufferPool {
    idle: ArrayQueue<BufferSet>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: ArrayQueue::new(capacity),
        }
    }

    /// An idle buffer set, or a fresh one when the pool is empty.
    pub fn checkout(self: &Arc<Self>) -> PooledBufferSet {
        PooledBufferSet {
            pool: Arc::clone(self),
            buffers: ManuallyDrop::new(self.idle.pop().unwrap_or_default()),
        }
    }

    /// Clear `buffers` and keep them for the next checkout. Oversized sets
    /// and sets that do not fit in the pool are dropped.
    pub fn recycle(&self, mut buffers: BufferSet) {
        // a connection that moved a huge LOAD DATA or BLOB should not pin that memory
        if buffers.read_buffer.capacity() > MAX_POOLED_CAPACITY
            || buffers.packet_buffer.capacity() > MAX_POOLED_CAPACITY
            || buffers.write_buffer.capacity() > MAX_POOLED_CAPACITY
        {
            return;
        }
        buffers.clear();
        let _ = self.idle.push(buffers);
    }

    /// Number of idle buffer sets.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_CAPACITY)
    }
}
