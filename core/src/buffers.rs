//! Segment-accounted byte buffers
//!
//! Every buffer draws its storage from a shared [`MemPool`] in fixed-size
//! segments. The pool is only an accounting device; the bytes live in a
//! contiguous `BytesMut`. Components use the free-segment count as a
//! back-pressure signal, so no single allocator can starve the others.

use alloc::sync::Arc;
use bytes::{Buf, BytesMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::options::{MEMPOOL_SEGMENT_COUNT, MEMPOOL_SEGMENT_SIZE};

#[derive(Debug)]
struct PoolState {
    segment_size: usize,
    total: usize,
    free: AtomicUsize,
}

/// Shared pool of fixed-size memory segments.
#[derive(Debug, Clone)]
pub struct MemPool {
    state: Arc<PoolState>,
}

impl MemPool {
    pub fn new(segment_size: usize, segment_count: usize) -> Self {
        Self {
            state: Arc::new(PoolState {
                segment_size: segment_size.max(1),
                total: segment_count,
                free: AtomicUsize::new(segment_count),
            }),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.state.segment_size
    }

    pub fn segments_total(&self) -> usize {
        self.state.total
    }

    pub fn segments_available(&self) -> usize {
        self.state.free.load(Ordering::Acquire)
    }

    /// Free capacity in bytes.
    pub fn bytes_available(&self) -> usize {
        self.segments_available() * self.segment_size()
    }

    fn try_reserve(&self, count: usize) -> bool {
        self.state
            .free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                free.checked_sub(count)
            })
            .is_ok()
    }

    fn release(&self, count: usize) {
        self.state.free.fetch_add(count, Ordering::AcqRel);
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new(MEMPOOL_SEGMENT_SIZE, MEMPOOL_SEGMENT_COUNT)
    }
}

/// A byte buffer whose capacity is charged to a [`MemPool`].
#[derive(Debug)]
pub struct Buffer {
    pool: MemPool,
    data: BytesMut,
    segments: usize,
}

impl Buffer {
    /// Creates an empty buffer. Empty buffers hold no segments.
    pub fn new(pool: &MemPool) -> Self {
        Self {
            pool: pool.clone(),
            data: BytesMut::new(),
            segments: 0,
        }
    }

    /// Creates a buffer holding a copy of `bytes`, or `None` if the pool
    /// cannot cover it.
    pub fn from_slice(pool: &MemPool, bytes: &[u8]) -> Option<Self> {
        let mut buffer = Self::new(pool);
        buffer.append(bytes).then_some(buffer)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Segments currently charged to the pool.
    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn segments_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.pool.segment_size())
    }

    /// Ensures room for `additional` more bytes without further pool
    /// allocation. Fails without side effects if the pool is exhausted.
    pub fn reserve(&mut self, additional: usize) -> bool {
        let needed = self.segments_for(self.data.len() + additional);
        if needed > self.segments {
            if !self.pool.try_reserve(needed - self.segments) {
                return false;
            }
            self.segments = needed;
            self.data.reserve(additional);
        }
        true
    }

    /// Appends `bytes` at the end. All or nothing.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if !self.reserve(bytes.len()) {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    /// Copies bytes starting at `offset` into `out`, returning the count.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        let Some(available) = self.data.get(offset..) else {
            return 0;
        };
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        count
    }

    /// Drops `count` bytes from the front, returning freed segments.
    pub fn advance(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.advance(count);
        self.trim();
    }

    /// Returns segments not needed for the current contents to the pool.
    pub fn trim(&mut self) {
        let needed = self.segments_for(self.data.len());
        if needed < self.segments {
            self.pool.release(self.segments - needed);
            self.segments = needed;
        }
    }

    /// Empties the buffer and releases all of its segments.
    pub fn reset(&mut self) {
        self.data = BytesMut::new();
        self.trim();
    }

    /// Moves the contents out, leaving this buffer empty.
    pub fn take(&mut self) -> Buffer {
        let empty = Buffer::new(&self.pool);
        core::mem::replace(self, empty)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.release(self.segments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_charges_segments() {
        let pool = MemPool::new(64, 4);
        let mut buffer = Buffer::new(&pool);
        assert!(buffer.append(&[1u8; 65]));
        assert_eq!(buffer.segments(), 2);
        assert_eq!(pool.segments_available(), 2);

        drop(buffer);
        assert_eq!(pool.segments_available(), 4);
    }

    #[test]
    fn test_append_fails_when_pool_exhausted() {
        let pool = MemPool::new(64, 2);
        let mut buffer = Buffer::new(&pool);
        assert!(buffer.append(&[0u8; 100]));
        assert!(!buffer.append(&[0u8; 100]));
        assert_eq!(buffer.len(), 100);
        assert_eq!(pool.segments_available(), 0);
    }

    #[test]
    fn test_advance_rebases_and_releases() {
        let pool = MemPool::new(64, 8);
        let mut buffer = Buffer::from_slice(&pool, &[7u8; 200]).unwrap();
        assert_eq!(buffer.segments(), 4);

        buffer.advance(150);
        assert_eq!(buffer.len(), 50);
        assert_eq!(buffer.segments(), 1);
        assert_eq!(pool.segments_available(), 7);

        buffer.advance(1000);
        assert!(buffer.is_empty());
        assert_eq!(pool.segments_available(), 8);
    }

    #[test]
    fn test_reserve_then_trim() {
        let pool = MemPool::new(64, 8);
        let mut buffer = Buffer::new(&pool);
        assert!(buffer.reserve(256));
        assert_eq!(pool.segments_available(), 4);
        assert!(buffer.append(&[1u8; 10]));
        assert_eq!(pool.segments_available(), 4);

        buffer.trim();
        assert_eq!(buffer.segments(), 1);
        assert_eq!(pool.segments_available(), 7);
    }

    #[test]
    fn test_read_from_offset() {
        let pool = MemPool::default();
        let buffer = Buffer::from_slice(&pool, b"HELLO\n").unwrap();
        let mut out = [0u8; 3];
        assert_eq!(buffer.read(2, &mut out), 3);
        assert_eq!(&out, b"LLO");
        assert_eq!(buffer.read(5, &mut out), 1);
        assert_eq!(buffer.read(9, &mut out), 0);
    }

    #[test]
    fn test_take_moves_segments() {
        let pool = MemPool::new(64, 4);
        let mut buffer = Buffer::from_slice(&pool, &[1u8; 64]).unwrap();
        let moved = buffer.take();
        assert!(buffer.is_empty());
        assert_eq!(buffer.segments(), 0);
        assert_eq!(moved.segments(), 1);
        assert_eq!(pool.segments_available(), 3);
    }
}
