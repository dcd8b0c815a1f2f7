use std::sync::Arc;

use crate::{
    buffer::{
        DumpFormat, SecureBuffer,
        pool::{ChunkPool, TrivialPool},
    },
    directory::Directory,
    thread::ThreadPool,
};

/// Services shared by every channel and listener of a process.
///
/// Built once by the application and cloned into each channel; nothing in the
/// crate reaches for global state instead.
#[derive(Clone)]
pub struct Runtime {
    pub pool: Arc<dyn ChunkPool>,
    /// Runs write completions.
    pub executor: Arc<ThreadPool>,
    /// Runs transport negotiation for accepted connections, so a peer that
    /// stalls its handshake never delays writes on other channels.
    pub handshakes: Arc<ThreadPool>,
    pub directory: Arc<Directory>,
    pub dump: DumpFormat,
}

impl Runtime {
    /// Runtime with a [`TrivialPool`] and `workers` threads in each of the
    /// completion and handshake pools.
    pub fn new(workers: usize) -> Self {
        Self {
            pool: Arc::new(TrivialPool::default()),
            executor: Arc::new(ThreadPool::new(workers)),
            handshakes: Arc::new(ThreadPool::new(workers)),
            directory: Arc::new(Directory::new()),
            dump: DumpFormat::default(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn ChunkPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_handshake_workers(mut self, workers: usize) -> Self {
        self.handshakes = Arc::new(ThreadPool::new(workers));
        self
    }

    pub fn with_dump_format(mut self, dump: DumpFormat) -> Self {
        self.dump = dump;
        self
    }

    pub fn buffer(&self) -> SecureBuffer {
        SecureBuffer::new(Arc::clone(&self.pool))
    }
}
