//! Buffer Pool
//!
//! Page-sized scratch buffers checked out for a scope and returned on drop.
//!
//! Checkout never blocks: an empty pool hands out a fresh allocation, and a
//! full pool simply drops the returned buffer.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

/// Fixed-capacity pool of equally sized byte buffers
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    /// Checkouts that had to allocate
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            misses: AtomicU64::new(0),
        }
    }

    /// Take a zeroed buffer of `buffer_size` bytes
    pub fn checkout(&self) -> PooledBuffer<'_> {
        let buf = match self.buffers.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.buffer_size, 0);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        };
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn give_back(&self, buf: Vec<u8>) {
        if buf.capacity() >= self.buffer_size {
            // Pool full: let it drop
            let _ = self.buffers.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]
pub struct PooledBuffer<'a> {
    buf: Option<Vec<u8>>,
    pool: &'a BufferPool,
}

impl PooledBuffer<'_> {
    /// Shrink the visible length (capacity is kept for reuse)
    pub fn truncate(&mut self, len: usize) {
        if let Some(buf) = self.buf.as_mut() {
            buf.truncate(len);
        }
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
