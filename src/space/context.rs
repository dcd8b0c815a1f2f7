use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::cancel::{CancellationToken, DEFAULT_POLL_INTERVAL};

/// A value held by a [`Context`] together with its write time and TTL.
/// A `None` TTL never expires.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    value: T,
    written_at: Instant,
    ttl: Option<Duration>,
}

impl<T> Entry<T> {
    pub fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            written_at: Instant::now(),
            ttl,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn written_at(&self) -> Instant {
        self.written_at
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Time spent in the space so far.
    pub fn elapsed(&self) -> Duration {
        self.written_at.elapsed()
    }

    /// Absolute instant after which the entry is unreachable.
    pub fn deadline(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.written_at + ttl)
    }

    /// Lifetime left before expiry, `None` for entries that never expire.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now > deadline)
    }
}

/// FIFO blocking queue of [`Entry`] values guarded by one lock and condvar.
///
/// Expired entries are dropped lazily, and only while they sit at the head.
pub struct Context<T> {
    name: String,
    queue: Mutex<VecDeque<Entry<T>>>,
    available: Condvar,
}

impl<T> Context<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entries currently held, expired ones not yet dropped included.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Appends `value` at the tail.
    pub fn write(&self, value: T, ttl: Option<Duration>) {
        self.queue.lock().push_back(Entry::new(value, ttl));
        self.available.notify_all();
    }

    /// Puts `value` back at the head with a fresh write time, so it is the next
    /// one observed.
    pub fn give_back(&self, value: T, ttl: Option<Duration>) {
        self.restore(Entry::new(value, ttl));
    }

    /// Puts a previously taken entry back at the head keeping its original
    /// write time, so its absolute deadline does not move.
    pub fn restore(&self, entry: Entry<T>) {
        self.queue.lock().push_front(entry);
        self.available.notify_all();
    }

    /// Removes and returns the head value, waiting up to `timeout` (`None`
    /// waits forever, zero never waits). A timed-out wait returns `None`.
    pub fn take(&self, timeout: Option<Duration>) -> Option<T> {
        self.take_entry(timeout).map(Entry::into_value)
    }

    pub fn take_entry(&self, timeout: Option<Duration>) -> Option<Entry<T>> {
        self.next(timeout, |queue| queue.pop_front())
    }

    /// Waits like [`Context::take_entry`] but returns `None` once `token` is
    /// cancelled, rechecking it at least every poll interval.
    pub fn take_cancellable(
        &self,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Option<Entry<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if token.is_cancelled() {
                return None;
            }
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(DEFAULT_POLL_INTERVAL),
                None => DEFAULT_POLL_INTERVAL,
            };
            if let Some(entry) = self.take_entry(Some(slice)) {
                return Some(entry);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
        }
    }

    fn next<R>(
        &self,
        timeout: Option<Duration>,
        mut pick: impl FnMut(&mut VecDeque<Entry<T>>) -> Option<R>,
    ) -> Option<R> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock();

        loop {
            let now = Instant::now();
            while queue.front().is_some_and(|entry| entry.is_expired_at(now)) {
                queue.pop_front();
                trace!("dropped expired entry from context '{}'", self.name);
            }

            if !queue.is_empty() {
                return pick(&mut queue);
            }

            match deadline {
                None => self.available.wait(&mut queue),
                Some(deadline) if now >= deadline => return None,
                Some(deadline) => {
                    self.available.wait_until(&mut queue, deadline);
                }
            }
        }
    }
}

impl<T: Clone> Context<T> {
    /// Returns a copy of the head value without removing it.
    pub fn read(&self, timeout: Option<Duration>) -> Option<T> {
        self.read_entry(timeout).map(Entry::into_value)
    }

    pub fn read_entry(&self, timeout: Option<Duration>) -> Option<Entry<T>> {
        self.next(timeout, |queue| queue.front().cloned())
    }
}

impl<T> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
