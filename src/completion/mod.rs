//! One-shot completion objects for asynchronous operations.
//!
//! A [`CompletionControl`] starts [`Outcome::Pending`] and moves exactly once
//! to a terminal outcome. Whoever reaches the lock first (the I/O callback, a
//! timer or an explicit [`CompletionControl::cancel`]) decides the outcome;
//! every later attempt is a no-op. Callers block on
//! [`CompletionControl::wait_completion`] or register a callback with
//! [`CompletionControl::on_complete`].
pub mod request;

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    Error,
    cancel::{CancellationToken, DEFAULT_POLL_INTERVAL},
};

pub use request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    /// Only reachable by a [`Request`] whose timer fired before a response.
    Expired,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        self != Outcome::Pending
    }
}

type Callback = Box<dyn FnOnce(Outcome) + Send>;

struct State {
    outcome: Outcome,
    message: Option<String>,
    error: Option<Arc<Error>>,
    completed_at: Option<Instant>,
    cancelled_at: Option<Instant>,
    callbacks: Vec<Callback>,
}

struct Inner {
    requested_at: Instant,
    state: Mutex<State>,
    done: Condvar,
}

/// Thread-safe, clonable handle on the outcome of one asynchronous operation.
#[derive(Clone)]
pub struct CompletionControl {
    inner: Arc<Inner>,
}

impl CompletionControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                requested_at: Instant::now(),
                state: Mutex::new(State {
                    outcome: Outcome::Pending,
                    message: None,
                    error: None,
                    completed_at: None,
                    cancelled_at: None,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// A control that already failed with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        let control = Self::new();
        control.fail_with_message(message);
        control
    }

    pub fn outcome(&self) -> Outcome {
        self.inner.state.lock().outcome
    }

    /// True once the operation finished, successfully or not. Cancellation
    /// does not count as completion.
    pub fn is_completed(&self) -> bool {
        matches!(
            self.outcome(),
            Outcome::Succeeded | Outcome::Failed | Outcome::Expired
        )
    }

    pub fn is_successful(&self) -> bool {
        self.outcome() == Outcome::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome() == Outcome::Cancelled
    }

    pub fn message(&self) -> Option<String> {
        self.inner.state.lock().message.clone()
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.inner.state.lock().error.clone()
    }

    pub fn requested_at(&self) -> Instant {
        self.inner.requested_at
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.inner.state.lock().completed_at
    }

    pub fn cancelled_at(&self) -> Option<Instant> {
        self.inner.state.lock().cancelled_at
    }

    /// Marks the operation finished. Returns `false` when it was already
    /// completed or cancelled.
    pub fn mark_completed(&self, success: bool) -> bool {
        let outcome = if success {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };
        self.settle(outcome, None, None, || {}).is_ok()
    }

    pub fn fail_with_message(&self, message: impl Into<String>) -> bool {
        self.settle(Outcome::Failed, Some(message.into()), None, || {})
            .is_ok()
    }

    pub fn fail_with_error(&self, error: impl Into<Error>) -> bool {
        let error = error.into();
        let message = error.to_string();
        self.settle(Outcome::Failed, Some(message), Some(error), || {})
            .is_ok()
    }

    /// Cancels a pending operation. A second cancel keeps the first timestamp.
    pub fn cancel(&self) -> bool {
        self.settle(Outcome::Cancelled, None, None, || {}).is_ok()
    }

    /// Blocks until the operation leaves [`Outcome::Pending`] or `timeout`
    /// elapses (`None` waits forever). With `auto_cancel`, a timed-out wait
    /// cancels the operation before returning.
    pub fn wait_completion(&self, timeout: Option<Duration>, auto_cancel: bool) -> Outcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut state = self.inner.state.lock();
            while state.outcome == Outcome::Pending {
                match deadline {
                    None => self.inner.done.wait(&mut state),
                    Some(deadline) => {
                        if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                }
            }
            if state.outcome.is_terminal() {
                return state.outcome;
            }
        }

        if auto_cancel {
            self.cancel();
        }
        self.outcome()
    }

    /// Like [`CompletionControl::wait_completion`] but gives up early once
    /// `token` is cancelled, rechecking it at least every poll interval.
    pub fn wait_cancellable(
        &self,
        timeout: Option<Duration>,
        auto_cancel: bool,
        token: &CancellationToken,
    ) -> Outcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(DEFAULT_POLL_INTERVAL),
                None => DEFAULT_POLL_INTERVAL,
            };
            let outcome = self.wait_completion(Some(slice), false);
            if outcome.is_terminal() {
                return outcome;
            }

            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if expired || token.is_cancelled() {
                if auto_cancel {
                    self.cancel();
                }
                return self.outcome();
            }
        }
    }

    /// Runs `callback` once the outcome is decided, immediately if it already is.
    pub fn on_complete(&self, callback: impl FnOnce(Outcome) + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_terminal() {
            let outcome = state.outcome;
            drop(state);
            callback(outcome);
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    /// Moves to `outcome` if still pending, running `apply` under the lock
    /// first. Returns the current outcome when another party won.
    pub(crate) fn settle(
        &self,
        outcome: Outcome,
        message: Option<String>,
        error: Option<Error>,
        apply: impl FnOnce(),
    ) -> Result<(), Outcome> {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_terminal() {
                return Err(state.outcome);
            }

            apply();
            let now = Instant::now();
            state.outcome = outcome;
            state.message = message;
            state.error = error.map(Arc::new);
            if outcome == Outcome::Cancelled {
                state.cancelled_at = Some(now);
            } else {
                state.completed_at = Some(now);
            }
            self.inner.done.notify_all();
            std::mem::take(&mut state.callbacks)
        };

        for callback in callbacks {
            callback(outcome);
        }
        Ok(())
    }
}

impl Default for CompletionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionControl")
            .field("outcome", &state.outcome)
            .field("message", &state.message)
            .finish()
    }
}
