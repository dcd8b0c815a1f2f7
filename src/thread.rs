//! Worker threads that run asynchronous I/O completions.
//!
//! Channels hand their write operations to a shared [`ThreadPool`]; each job
//! runs the blocking transport call and then the channel's completion
//! callback on the same worker thread. Listeners negotiate accepted
//! connections on a second pool.
use std::{
    sync::{Arc, mpsc},
    thread,
};

use log::{debug, error};
use parking_lot::Mutex;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));

        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver)));
        }

        Self {
            workers,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` for execution. Returns `false` once the pool is shutting down.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(&mut self) {
        drop(self.sender.lock().take());

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            // The last handle on the pool can be released by one of its own jobs.
            if worker.thread.thread().id() == current {
                continue;
            }
            if worker.thread.join().is_err() {
                error!("worker {} panicked", worker.id);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = receiver.lock().recv();
                match msg {
                    Ok(job) => job(),
                    Err(_) => {
                        debug!("worker {id} disconnected!");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}
