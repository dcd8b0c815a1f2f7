//! Backing storage for [`SecureBuffer`](super::SecureBuffer).
//!
//! A [`ChunkPool`] hands out fixed-capacity [`Chunk`]s and takes them back when
//! a buffer grows or is disposed. [`TrivialPool`] allocates on every checkout
//! and drops on checkin; [`RecyclingPool`] keeps returned chunks in per-size
//! free lists, much like a pager keeps a list of freed pages for reuse.
use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;
use parking_lot::Mutex;

/// Size of a chunk when the caller does not ask for one.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Fixed-capacity byte region checked out from a [`ChunkPool`].
pub struct Chunk {
    bytes: Box<[u8]>,
}

impl Chunk {
    fn zeroed(size: usize) -> Self {
        Self {
            bytes: vec![0; size].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("capacity", &self.capacity())
            .finish()
    }
}

pub trait ChunkPool: Send + Sync {
    /// Hands out a chunk of at least `size` bytes; `None` asks for the pool's
    /// default size.
    fn checkout(&self, size: Option<usize>) -> Chunk;

    /// Returns a chunk previously handed out by [`ChunkPool::checkout`].
    fn checkin(&self, chunk: Chunk);

    /// Number of chunks checked out and not yet returned.
    fn outstanding(&self) -> usize;
}

/// Allocates a fresh chunk per checkout and drops it on checkin.
#[derive(Debug)]
pub struct TrivialPool {
    chunk_size: usize,
    outstanding: AtomicUsize,
}

impl TrivialPool {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        Self {
            chunk_size,
            outstanding: AtomicUsize::new(0),
        }
    }
}

impl Default for TrivialPool {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkPool for TrivialPool {
    fn checkout(&self, size: Option<usize>) -> Chunk {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Chunk::zeroed(size.unwrap_or(self.chunk_size))
    }

    fn checkin(&self, chunk: Chunk) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        drop(chunk);
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Keeps returned chunks in free lists keyed by capacity.
///
/// Requested sizes are rounded up to a multiple of the default chunk size so
/// that growth requests land in a small number of buckets.
#[derive(Debug)]
pub struct RecyclingPool {
    chunk_size: usize,
    max_per_bucket: usize,
    free: Mutex<HashMap<usize, Vec<Chunk>>>,
    outstanding: AtomicUsize,
}

impl RecyclingPool {
    pub fn new(chunk_size: usize, max_per_bucket: usize) -> Self {
        assert!(chunk_size > 0);
        Self {
            chunk_size,
            max_per_bucket,
            free: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, size: usize) -> usize {
        size.max(1).div_ceil(self.chunk_size) * self.chunk_size
    }

    /// Number of chunks currently parked in the free lists.
    pub fn idle(&self) -> usize {
        self.free.lock().values().map(Vec::len).sum()
    }
}

impl ChunkPool for RecyclingPool {
    fn checkout(&self, size: Option<usize>) -> Chunk {
        let bucket = self.bucket(size.unwrap_or(self.chunk_size));
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        let recycled = self.free.lock().get_mut(&bucket).and_then(Vec::pop);
        match recycled {
            Some(mut chunk) => {
                trace!("reusing chunk of {bucket} bytes");
                chunk.as_mut_slice().fill(0);
                chunk
            }
            None => Chunk::zeroed(bucket),
        }
    }

    fn checkin(&self, chunk: Chunk) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        let bucket = chunk.capacity();
        if bucket % self.chunk_size != 0 {
            return;
        }

        let mut free = self.free.lock();
        let list = free.entry(bucket).or_default();
        if list.len() < self.max_per_bucket {
            list.push(chunk);
        }
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_pool_counts_outstanding() {
        let pool = TrivialPool::new(64);

        let a = pool.checkout(None);
        let b = pool.checkout(Some(10));
        assert_eq!(a.capacity(), 64);
        assert_eq!(b.capacity(), 10);
        assert_eq!(pool.outstanding(), 2);

        pool.checkin(a);
        pool.checkin(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn recycling_pool_reuses_bucket() {
        let pool = RecyclingPool::new(64, 4);

        let mut chunk = pool.checkout(Some(100));
        assert_eq!(chunk.capacity(), 128);
        chunk.as_mut_slice()[0] = 7;
        pool.checkin(chunk);
        assert_eq!(pool.idle(), 1);

        let chunk = pool.checkout(Some(65));
        assert_eq!(chunk.capacity(), 128);
        assert_eq!(chunk.as_slice()[0], 0);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn recycling_pool_caps_free_list() {
        let pool = RecyclingPool::new(16, 1);

        let a = pool.checkout(None);
        let b = pool.checkout(None);
        pool.checkin(a);
        pool.checkin(b);

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.outstanding(), 0);
    }
}
