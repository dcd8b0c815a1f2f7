use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, error, trace};
use parking_lot::Mutex;

use crate::error::RequestStateError;

use super::{CompletionControl, Outcome};

struct Inner<M> {
    control: CompletionControl,
    key: Option<String>,
    timeout: Duration,
    send_to_tuple_space: AtomicBool,
    timer_started: AtomicBool,
    sent: Mutex<Option<M>>,
    received: Mutex<Option<M>>,
}

/// A [`CompletionControl`] that waits for a correlated response.
///
/// The expiration timer is armed separately with [`Request::start_timer`], so
/// the sender can finish configuring the request before the clock starts.
/// Exactly one of response delivery, timer expiry and cancellation succeeds.
pub struct Request<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Request<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Send + 'static> Request<M> {
    pub fn new(key: Option<String>, message: M, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                control: CompletionControl::new(),
                key,
                timeout,
                send_to_tuple_space: AtomicBool::new(false),
                timer_started: AtomicBool::new(false),
                sent: Mutex::new(Some(message)),
                received: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.inner.key.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn control(&self) -> &CompletionControl {
        &self.inner.control
    }

    pub fn outcome(&self) -> Outcome {
        self.inner.control.outcome()
    }

    pub fn is_expired(&self) -> bool {
        self.outcome() == Outcome::Expired
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome() == Outcome::Cancelled
    }

    pub fn is_answered(&self) -> bool {
        self.outcome() == Outcome::Succeeded
    }

    /// When set, a correlated response is also written to the channel's
    /// tuple-space context.
    pub fn send_to_tuple_space(&self) -> bool {
        self.inner.send_to_tuple_space.load(Ordering::SeqCst)
    }

    pub fn set_send_to_tuple_space(&self, value: bool) {
        self.inner.send_to_tuple_space.store(value, Ordering::SeqCst);
    }

    pub fn sent_message(&self) -> Option<M>
    where
        M: Clone,
    {
        self.inner.sent.lock().clone()
    }

    pub fn received_message(&self) -> Option<M>
    where
        M: Clone,
    {
        self.inner.received.lock().clone()
    }

    pub fn take_received_message(&self) -> Option<M> {
        self.inner.received.lock().take()
    }

    /// Arms the expiration timer on its own thread. Later calls are no-ops.
    pub fn start_timer(&self) -> bool {
        if self.inner.timer_started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("request-timer".into())
            .spawn(move || {
                let outcome = inner.control.wait_completion(Some(inner.timeout), false);
                if outcome != Outcome::Pending {
                    return;
                }
                let expired = inner.control.settle(
                    Outcome::Expired,
                    Some("request expired waiting for a response".into()),
                    None,
                    || {},
                );
                if expired.is_ok() {
                    debug!("request {:?} expired after {:?}", inner.key, inner.timeout);
                }
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                error!("failed to arm request timer: {e}");
                self.inner.timer_started.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Delivers the response. Rejected once the request expired, was cancelled
    /// or was already answered; the caller must then treat `message` as undelivered.
    pub fn set_response_message(&self, message: M) -> Result<(), RequestStateError> {
        let inner = &self.inner;
        inner
            .control
            .settle(Outcome::Succeeded, None, None, || {
                *inner.received.lock() = Some(message);
            })
            .map_err(|outcome| {
                trace!("late response for request {:?} ({outcome:?})", inner.key);
                match outcome {
                    Outcome::Expired => RequestStateError::Expired,
                    Outcome::Cancelled => RequestStateError::Cancelled,
                    Outcome::Failed => RequestStateError::Failed,
                    _ => RequestStateError::AlreadyAnswered,
                }
            })
    }

    pub fn cancel(&self) -> bool {
        self.inner.control.cancel()
    }

    /// Moves the request to the "failed to send" state.
    pub fn fail_send(&self, reason: impl Into<String>) -> bool {
        self.inner.control.fail_with_message(reason)
    }

    /// Blocks until the request settles and returns the response if one arrived.
    /// A `timeout` that elapses first yields [`RequestStateError::Pending`] and
    /// leaves the request free to complete later.
    pub fn wait_response(&self, timeout: Option<Duration>) -> Result<M, RequestStateError> {
        match self.inner.control.wait_completion(timeout, false) {
            Outcome::Succeeded => self
                .take_received_message()
                .ok_or(RequestStateError::AlreadyAnswered),
            Outcome::Expired => Err(RequestStateError::Expired),
            Outcome::Pending => Err(RequestStateError::Pending),
            Outcome::Cancelled => Err(RequestStateError::Cancelled),
            Outcome::Failed => Err(RequestStateError::Failed),
        }
    }
}

impl<M> fmt::Debug for Request<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("key", &self.inner.key)
            .field("timeout", &self.inner.timeout)
            .field("control", &self.inner.control)
            .finish()
    }
}
