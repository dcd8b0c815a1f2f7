//! The channel engine.
//!
//! A [`Channel`] moves between [`ConnectionState::Disconnected`],
//! [`ConnectionState::Connecting`] and [`ConnectionState::Connected`] and
//! drives one [`Transport`] at a time:
//!
//! * a dedicated reader thread fills the receive buffer and hands it to the
//!   [`Pipeline`], delivering every completed message to a pending
//!   [`Request`] or to the channel's tuple-space context;
//! * writes run on the runtime's executor, one at a time, with later sends
//!   waiting in a FIFO queue;
//! * every callback carries the connection epoch it was issued under and
//!   becomes a no-op once the channel has been closed or reconnected.
//!
//! All failures end in the same idempotent disconnect cleanup.
pub mod listener;
pub mod pipeline;
pub mod tls;
pub mod transport;

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Weak},
    thread,
};

use log::{Level, debug, error, info, log, log_enabled, trace, warn};
use parking_lot::Mutex;

use crate::{
    Error,
    buffer::SecureBuffer,
    completion::{CompletionControl, Outcome, Request},
    config::ChannelConfig,
    error::{ConfigurationError, ConnectionError, FramingError},
    runtime::Runtime,
    space::Context,
};

use pipeline::{ChannelEvent, Outbound, Pipeline, ReceiveContext, SendContext};
use transport::{Side, Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A serialized message waiting for, or undergoing, transmission.
struct PendingSend {
    buffer: SecureBuffer,
    control: CompletionControl,
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        self.buffer.dispose();
        self.control.fail_with_message("send abandoned");
    }
}

struct State<M> {
    connection: ConnectionState,
    epoch: u64,
    transport: Option<Arc<dyn Transport>>,
    peer: Option<SocketAddr>,
    sending: bool,
    queue: VecDeque<PendingSend>,
    requests: HashMap<String, Request<M>>,
}

struct Shared<P: Pipeline> {
    config: ChannelConfig,
    runtime: Runtime,
    factory: Arc<dyn TransportFactory>,
    pipeline: Mutex<P>,
    state: Mutex<State<P::Message>>,
    context: Arc<Context<Incoming<P>>>,
}

/// A message received by a channel, as written to its context.
pub struct Incoming<P: Pipeline> {
    message: P::Message,
    channel: Weak<Shared<P>>,
}

impl<P: Pipeline> Incoming<P> {
    pub fn message(&self) -> &P::Message {
        &self.message
    }

    pub fn into_message(self) -> P::Message {
        self.message
    }

    /// The channel the message arrived on, while it still exists.
    pub fn channel(&self) -> Option<Channel<P>> {
        self.channel.upgrade().map(|shared| Channel { shared })
    }

    /// Sends `message` back on the source channel.
    pub fn reply(&self, message: P::Message) -> CompletionControl {
        match self.channel() {
            Some(channel) => channel.send(message),
            None => failed_with(ConnectionError::Disconnected),
        }
    }
}

impl<P: Pipeline> Clone for Incoming<P> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            channel: Weak::clone(&self.channel),
        }
    }
}

impl<P: Pipeline> fmt::Debug for Incoming<P>
where
    P::Message: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("message", &self.message)
            .finish()
    }
}

/// Handle on one channel. Clones share the same connection.
///
/// A connected channel stays alive until it is closed or the peer goes away,
/// even when every handle has been dropped.
pub struct Channel<P: Pipeline> {
    shared: Arc<Shared<P>>,
}

impl<P: Pipeline> Clone for Channel<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Pipeline> Channel<P> {
    pub fn new(
        config: ChannelConfig,
        pipeline: P,
        factory: Arc<dyn TransportFactory>,
        runtime: Runtime,
        context: Arc<Context<Incoming<P>>>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                factory,
                pipeline: Mutex::new(pipeline),
                state: Mutex::new(State {
                    connection: ConnectionState::Disconnected,
                    epoch: 0,
                    transport: None,
                    peer: None,
                    sending: false,
                    queue: VecDeque::new(),
                    requests: HashMap::new(),
                }),
                context,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().peer
    }

    /// Context receiving the messages no request claimed.
    pub fn context(&self) -> Arc<Context<Incoming<P>>> {
        Arc::clone(&self.shared.context)
    }

    /// Sends waiting behind the one in flight.
    pub fn queued_sends(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Connects to `remote_address` on a thread of its own, so a slow peer
    /// only holds up this channel. The returned control succeeds once the
    /// transport is established and the receive loop runs.
    pub fn connect(&self) -> CompletionControl {
        let epoch = {
            let mut state = self.shared.state.lock();
            if state.connection != ConnectionState::Disconnected {
                return CompletionControl::failed("channel already connecting or connected");
            }
            state.connection = ConnectionState::Connecting;
            state.epoch += 1;
            state.epoch
        };

        let control = CompletionControl::new();
        let done = control.clone();
        let channel = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-connect", self.name()))
            .spawn(move || match channel.establish(epoch) {
                Ok(()) => {
                    done.mark_completed(true);
                }
                Err(e) => {
                    log!(e.severity(), "{}: connect failed: {e}", channel.name());
                    channel.abort_connect(epoch);
                    done.fail_with_error(e);
                }
            });
        if let Err(e) = spawned {
            self.abort_connect(epoch);
            control.fail_with_error(Error::Thread(e));
        }
        control
    }

    /// Adopts an already established transport and starts receiving on it.
    pub fn open(&self, transport: Arc<dyn Transport>) -> Result<(), ConnectionError> {
        self.attach(transport, None)
    }

    /// Serializes `message` through the pipeline and queues it for
    /// transmission. Sends complete in submission order.
    pub fn send(&self, message: P::Message) -> CompletionControl {
        if !self.is_connected() {
            return CompletionControl::failed("channel not connected");
        }

        let mut context = SendContext::new(message, Arc::clone(&self.shared.runtime.pool));
        if let Err(e) = self.shared.pipeline.lock().send(&mut context) {
            warn!("{}: pipeline failed to serialize message: {e}", self.name());
            return failed_with(e);
        }

        let buffer = match context.message_to_send {
            Outbound::Bytes(buffer) => buffer,
            Outbound::Nothing => return CompletionControl::failed("message consumed by pipeline"),
            Outbound::Message(_) => return failed_with(FramingError::NotSerialized),
        };
        if log_enabled!(Level::Trace) {
            trace!(
                "{}: sending {} bytes\n{}",
                self.name(),
                buffer.len(),
                buffer.dump(&self.shared.runtime.dump)
            );
        }

        let control = CompletionControl::new();
        self.start_send(PendingSend {
            buffer,
            control: control.clone(),
        });
        control
    }

    /// Sends the request's message and arms its timer. A response whose
    /// correlation key matches the request's key completes it; a failed send
    /// moves it to the failed state.
    pub fn request(&self, request: &Request<P::Message>) -> CompletionControl {
        let Some(message) = request.sent_message() else {
            return CompletionControl::failed("request carries no message");
        };

        if let Some(key) = request.key() {
            let mut state = self.shared.state.lock();
            state.requests.retain(|_, pending| !pending.outcome().is_terminal());
            state.requests.insert(key.to_string(), request.clone());
        }

        let control = self.send(message);
        let sent = control.clone();
        let pending = request.clone();
        let shared = Arc::downgrade(&self.shared);
        control.on_complete(move |outcome| {
            if outcome == Outcome::Succeeded {
                return;
            }
            if let (Some(key), Some(shared)) = (pending.key(), shared.upgrade()) {
                shared.state.lock().requests.remove(key);
            }
            pending.fail_send(sent.message().unwrap_or_else(|| format!("send {outcome:?}")));
        });

        request.start_timer();
        control
    }

    /// Disconnects, failing every queued send with "channel disconnected".
    pub fn close(&self) {
        self.disconnect(None, None);
    }

    fn establish(&self, epoch: u64) -> Result<(), Error> {
        let config = &self.shared.config;
        let remote = config
            .remote_address
            .as_deref()
            .ok_or(ConfigurationError::InvalidValue {
                field: "remote_address",
                reason: "required to connect".into(),
            })?;

        let address = match self.shared.runtime.directory.lookup(remote) {
            Some(address) => address,
            None => config.resolve(remote, false)?,
        };
        debug!("{}: connecting to {address}", self.name());

        let stream = transport::connect(address, config)?;
        let transport = self.shared.factory.establish(stream, Side::Client, config)?;
        self.attach(transport, Some(epoch))?;
        Ok(())
    }

    fn abort_connect(&self, epoch: u64) {
        let mut state = self.shared.state.lock();
        if state.epoch == epoch && state.connection == ConnectionState::Connecting {
            state.connection = ConnectionState::Disconnected;
        }
    }

    /// Installs `transport` as the current connection. `connecting` is the
    /// epoch of the connect attempt that produced it; the transport is shut
    /// down if that attempt was superseded.
    fn attach(
        &self,
        transport: Arc<dyn Transport>,
        connecting: Option<u64>,
    ) -> Result<(), ConnectionError> {
        let peer = transport.peer_addr();
        let epoch = {
            let mut state = self.shared.state.lock();
            let refusal = match connecting {
                Some(epoch)
                    if state.epoch != epoch
                        || state.connection != ConnectionState::Connecting =>
                {
                    Some(ConnectionError::Disconnected)
                }
                None if state.connection != ConnectionState::Disconnected => Some(
                    ConnectionError::Rejected("channel already connecting or connected".into()),
                ),
                _ => None,
            };
            if let Some(e) = refusal {
                drop(state);
                let _ = transport.shutdown();
                return Err(e);
            }

            state.connection = ConnectionState::Connected;
            state.epoch += 1;
            state.transport = Some(Arc::clone(&transport));
            state.peer = peer;
            state.sending = false;
            state.epoch
        };
        info!("{}: connected to {peer:?}", self.name());

        self.shared
            .pipeline
            .lock()
            .process_channel_event(&mut ChannelEvent::Connected { peer });

        let channel = self.clone();
        let reader = Arc::clone(&transport);
        let spawned = thread::Builder::new()
            .name(format!("{}-rx", self.name()))
            .spawn(move || channel.receive_loop(epoch, reader));
        if let Err(e) = spawned {
            let e = ConnectionError::Io(e);
            self.disconnect(Some(epoch), Some(&e));
            return Err(e);
        }
        Ok(())
    }

    fn start_send(&self, pending: PendingSend) {
        let mut state = self.shared.state.lock();
        let transport = state
            .transport
            .clone()
            .filter(|_| state.connection == ConnectionState::Connected);
        let Some(transport) = transport else {
            drop(state);
            pending.control.fail_with_message("channel not connected");
            return;
        };

        if state.sending {
            state.queue.push_back(pending);
            return;
        }
        state.sending = true;
        let epoch = state.epoch;
        drop(state);

        self.dispatch(epoch, transport, pending);
    }

    /// Issues one write of at most `send_max_request_size` bytes.
    fn dispatch(&self, epoch: u64, transport: Arc<dyn Transport>, pending: PendingSend) {
        let channel = self.clone();
        let limit = self.shared.config.send_max_request_size;
        let queued = self.shared.runtime.executor.execute(move || {
            let written = pending
                .buffer
                .data_segments(limit)
                .map_err(io::Error::other)
                .and_then(|segments| match segments.first() {
                    Some(segment) => transport.write(segment),
                    None => Ok(0),
                });
            channel.on_write_complete(epoch, transport, pending, written);
        });
        if !queued {
            error!("{}: executor is shutting down, dropping connection", self.name());
            self.disconnect(Some(epoch), None);
        }
    }

    fn on_write_complete(
        &self,
        epoch: u64,
        transport: Arc<dyn Transport>,
        mut pending: PendingSend,
        written: io::Result<usize>,
    ) {
        if self.shared.state.lock().epoch != epoch {
            trace!("{}: write completed on a stale connection", self.name());
            pending.buffer.dispose();
            pending.control.fail_with_error(ConnectionError::Disconnected);
            return;
        }

        let progress = written.and_then(|n| {
            if n == 0 && !pending.buffer.is_empty() {
                return Err(io::ErrorKind::WriteZero.into());
            }
            pending.buffer.discard(n).map_err(io::Error::other)
        });

        if let Err(e) = progress {
            let e = ConnectionError::classify(e);
            self.disconnect(Some(epoch), Some(&e));
            pending.buffer.dispose();
            pending.control.fail_with_error(e);
            return;
        }

        if !pending.buffer.is_empty() {
            self.dispatch(epoch, transport, pending);
            return;
        }

        pending.buffer.dispose();
        pending.control.mark_completed(true);

        let next = {
            let mut state = self.shared.state.lock();
            if state.epoch != epoch {
                return;
            }
            let next = state.queue.pop_front();
            state.sending = next.is_some();
            next
        };
        if let Some(next) = next {
            self.dispatch(epoch, transport, next);
        }
    }

    fn receive_loop(self, epoch: u64, transport: Arc<dyn Transport>) {
        let mut buffer = self.shared.runtime.buffer();
        let mut expected: isize = 0;

        loop {
            if buffer.tail_room() == 0 {
                let grown = if buffer.head_room() > 0 {
                    buffer.compact()
                } else {
                    buffer.expand()
                };
                if let Err(e) = grown {
                    error!("{}: receive buffer: {e}", self.name());
                    self.disconnect(Some(epoch), None);
                    break;
                }
            }

            let read = match buffer.free_segments() {
                Ok(mut segments) => match segments.first_mut() {
                    Some(segment) => transport.read(segment),
                    None => Err(io::Error::other("receive buffer has no free space")),
                },
                Err(e) => Err(io::Error::other(e)),
            };

            if self.shared.state.lock().epoch != epoch {
                trace!("{}: receive loop superseded", self.name());
                break;
            }

            let count = match read {
                Ok(0) => {
                    debug!("{}: peer closed the connection", self.name());
                    self.disconnect(Some(epoch), None);
                    break;
                }
                Ok(count) => count,
                Err(e) => {
                    let e = ConnectionError::classify(e);
                    self.disconnect(Some(epoch), Some(&e));
                    break;
                }
            };

            if let Err(e) = buffer.commit(count) {
                error!("{}: receive buffer: {e}", self.name());
                self.disconnect(Some(epoch), None);
                break;
            }
            if log_enabled!(Level::Trace) {
                trace!(
                    "{}: received {count} bytes\n{}",
                    self.name(),
                    buffer.dump(&self.shared.runtime.dump)
                );
            }

            if expected > 0 && (buffer.len() as isize) < expected {
                continue;
            }

            match self.process(&mut buffer, &mut expected) {
                Ok(messages) => {
                    for (key, message) in messages {
                        self.deliver(key, message);
                    }
                }
                Err(e) => {
                    error!("{}: framing error: {e}", self.name());
                    self.disconnect(Some(epoch), None);
                    break;
                }
            }
        }
    }

    /// Runs the pipeline over the buffered bytes until it needs more data or
    /// the buffer is empty.
    fn process(
        &self,
        buffer: &mut SecureBuffer,
        expected: &mut isize,
    ) -> Result<Vec<(Option<String>, P::Message)>, FramingError> {
        let mut messages = Vec::new();
        let mut pipeline = self.shared.pipeline.lock();

        while !buffer.is_empty() {
            let before = buffer.len();
            let mut context = ReceiveContext {
                received_message: &mut *buffer,
                expected_bytes: *expected,
                message: None,
            };
            let complete = pipeline.receive(&mut context)?;
            let ReceiveContext {
                expected_bytes,
                message,
                ..
            } = context;

            if expected_bytes < 0 {
                return Err(FramingError::NegativeExpectedBytes(expected_bytes));
            }
            *expected = expected_bytes;
            if !complete {
                break;
            }

            let message = match message {
                Some(message) => message,
                None if buffer.len() == before => {
                    let count = match *expected {
                        0 => buffer.len(),
                        n => (n as usize).min(buffer.len()),
                    };
                    P::Message::from(buffer.read(true, count)?)
                }
                None => continue,
            };
            messages.push((pipeline.correlation_key(&message), message));
            *expected = 0;
        }

        if buffer.is_empty() {
            buffer.clear();
        }
        Ok(messages)
    }

    fn deliver(&self, key: Option<String>, message: P::Message) {
        if let Some(key) = key {
            let request = self.shared.state.lock().requests.remove(&key);
            if let Some(request) = request {
                let copy = request.send_to_tuple_space().then(|| message.clone());
                match request.set_response_message(message) {
                    Ok(()) => {
                        if let Some(copy) = copy {
                            self.write_incoming(copy);
                        }
                    }
                    Err(e) => debug!("{}: dropping response '{key}': {e}", self.name()),
                }
                return;
            }
        }
        self.write_incoming(message);
    }

    fn write_incoming(&self, message: P::Message) {
        let incoming = Incoming {
            message,
            channel: Arc::downgrade(&self.shared),
        };
        self.shared
            .context
            .write(incoming, self.shared.config.receive_ttl());
    }

    /// Common cleanup for explicit close, peer close and I/O failure. `epoch`
    /// restricts it to one connection; `None` tears down whatever is current.
    /// Returns `false` when there was nothing to do.
    fn disconnect(&self, epoch: Option<u64>, cause: Option<&ConnectionError>) -> bool {
        let (transport, queue, peer) = {
            let mut state = self.shared.state.lock();
            if epoch.is_some_and(|epoch| epoch != state.epoch)
                || state.connection == ConnectionState::Disconnected
            {
                return false;
            }
            state.connection = ConnectionState::Disconnected;
            state.epoch += 1;
            state.sending = false;
            (
                state.transport.take(),
                std::mem::take(&mut state.queue),
                state.peer.take(),
            )
        };

        match cause {
            Some(e) => log!(e.severity(), "{}: disconnected from {peer:?}: {e}", self.name()),
            None => info!("{}: disconnected from {peer:?}", self.name()),
        }

        if let Some(transport) = &transport {
            if let Err(e) = transport.shutdown() {
                debug!("{}: transport shutdown: {e}", self.name());
            }
        }

        for mut pending in queue {
            pending.buffer.dispose();
            pending.control.fail_with_error(ConnectionError::Disconnected);
        }

        if transport.is_some() {
            self.shared
                .pipeline
                .lock()
                .process_channel_event(&mut ChannelEvent::Disconnected);
        }
        true
    }
}

impl<P: Pipeline> fmt::Debug for Channel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Channel")
            .field("name", &self.shared.config.name)
            .field("state", &state.connection)
            .field("epoch", &state.epoch)
            .field("peer", &state.peer)
            .field("queued", &state.queue.len())
            .finish()
    }
}

fn failed_with(error: impl Into<Error>) -> CompletionControl {
    let control = CompletionControl::new();
    control.fail_with_error(error);
    control
}
