//! Contract between the channel engine and the message transformation chain.
use std::{net::SocketAddr, sync::Arc};

use crate::{
    buffer::{SecureBuffer, pool::ChunkPool},
    error::FramingError,
};

/// What the engine transmits after [`Pipeline::send`] ran.
#[derive(Debug)]
pub enum Outbound<M> {
    /// Application message not yet serialized.
    Message(M),
    /// Serialized bytes ready for the transport.
    Bytes(SecureBuffer),
    /// The pipeline consumed the message; nothing is transmitted.
    Nothing,
}

pub struct SendContext<M> {
    pub message_to_send: Outbound<M>,
    pool: Arc<dyn ChunkPool>,
}

impl<M> SendContext<M> {
    pub(crate) fn new(message: M, pool: Arc<dyn ChunkPool>) -> Self {
        Self {
            message_to_send: Outbound::Message(message),
            pool,
        }
    }

    /// Takes the unserialized message, leaving [`Outbound::Nothing`] behind.
    pub fn take_message(&mut self) -> Option<M> {
        match std::mem::replace(&mut self.message_to_send, Outbound::Nothing) {
            Outbound::Message(message) => Some(message),
            other => {
                self.message_to_send = other;
                None
            }
        }
    }

    /// An empty buffer from the channel's chunk pool.
    pub fn buffer(&self) -> SecureBuffer {
        SecureBuffer::new(Arc::clone(&self.pool))
    }
}

/// Buffered bytes handed to [`Pipeline::receive`].
pub struct ReceiveContext<'a, M> {
    pub received_message: &'a mut SecureBuffer,
    /// Bytes the pipeline needs before it can make progress; zero when it has
    /// no expectation. A negative value is a framing error.
    pub expected_bytes: isize,
    /// Set by the pipeline when it produced a message.
    pub message: Option<M>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { peer: Option<SocketAddr> },
    Disconnected,
    /// Raised by a listener before it adopts an accepted connection; clearing
    /// `accept` rejects the connection.
    ConnectionRequest { peer: SocketAddr, accept: bool },
}

pub trait Pipeline: Send + 'static {
    /// Application message. Raw bytes the pipeline leaves untransformed are
    /// delivered through the `From<Vec<u8>>` conversion.
    type Message: Clone + Send + From<Vec<u8>> + 'static;

    /// Serializes `context.message_to_send` into [`Outbound::Bytes`], or sets
    /// it to [`Outbound::Nothing`] to swallow the message.
    fn send(&mut self, context: &mut SendContext<Self::Message>) -> Result<(), FramingError>;

    /// Returns `true` when a complete message is available, `false` when more
    /// bytes are needed.
    fn receive(
        &mut self,
        context: &mut ReceiveContext<'_, Self::Message>,
    ) -> Result<bool, FramingError>;

    fn process_channel_event(&mut self, event: &mut ChannelEvent) {
        let _ = event;
    }

    /// Key used to match a received message with a pending request.
    fn correlation_key(&self, message: &Self::Message) -> Option<String> {
        let _ = message;
        None
    }
}
