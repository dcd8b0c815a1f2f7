//! Dedicated threads that drain a tuple-space context.
//!
//! Stopping a worker never interrupts it: [`Worker::stop`] cancels a token the
//! loop rechecks between bounded waits, then joins the thread.
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, trace, warn};

use crate::{
    Error,
    cancel::CancellationToken,
    channel::{Channel, pipeline::Pipeline},
    completion::Outcome,
    error::ConfigurationError,
    space::{Context, Entry},
};

#[derive(Debug)]
pub struct Worker {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Runs `handler` on every entry taken from `context`, waiting at most
    /// `poll` between cancellation checks.
    pub fn spawn<T, F>(
        name: impl Into<String>,
        context: Arc<Context<T>>,
        poll: Duration,
        mut handler: F,
    ) -> Result<Self, Error>
    where
        T: Send + 'static,
        F: FnMut(Entry<T>) + Send + 'static,
    {
        if poll.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                field: "poll",
                reason: "must be greater than zero".into(),
            }
            .into());
        }

        let name = name.into();
        let token = CancellationToken::new();
        let stop = token.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!("worker '{}' draining '{}'", thread_name(), context.name());
                while !stop.is_cancelled() {
                    if let Some(entry) = context.take_cancellable(Some(poll), &stop) {
                        handler(entry);
                    }
                }
                debug!("worker '{}' stopped", thread_name());
            })
            .map_err(Error::Thread)?;

        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    /// Sends every message written to `context` on `channel`. While the
    /// channel is down the entry goes back to the head of the context with
    /// its original deadline and the worker waits `retry` before trying again.
    pub fn forward<P: Pipeline>(
        name: impl Into<String>,
        context: Arc<Context<P::Message>>,
        channel: Channel<P>,
        retry: Duration,
    ) -> Result<Self, Error> {
        let requeue = Arc::clone(&context);
        Self::spawn(name, context, retry, move |entry: Entry<P::Message>| {
            if !channel.is_connected() {
                trace!("{}: not connected, requeueing message", channel.name());
                requeue.restore(entry);
                thread::sleep(retry);
                return;
            }

            let control = channel.send(entry.into_value());
            let name = channel.name().to_string();
            control.on_complete(move |outcome| {
                if outcome != Outcome::Succeeded {
                    warn!("{name}: forwarded message failed ({outcome:?})");
                }
            });
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels the loop and waits for the thread to exit.
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("worker").to_string()
}
