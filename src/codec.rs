//! Ready-made pipelines.
//!
//! [`RawPipeline`] passes bytes through untouched, so received data reaches
//! the context exactly as read. [`FramedPipeline`] carries bincode encoded
//! [`Envelope`]s behind a 4-byte big-endian length prefix.
use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
};

use crate::{
    channel::pipeline::{Outbound, Pipeline, ReceiveContext, SendContext},
    error::FramingError,
};

/// Length prefix in front of every framed envelope.
pub const HEADER_LEN: usize = 4;

/// Upper bound for `max_frame_size`. Decoding never claims more memory than
/// this, whatever lengths an envelope declares.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct RawPipeline;

impl Pipeline for RawPipeline {
    type Message = Vec<u8>;

    fn send(&mut self, context: &mut SendContext<Vec<u8>>) -> Result<(), FramingError> {
        if let Some(message) = context.take_message() {
            let mut buffer = context.buffer();
            buffer.write(false, &message)?;
            context.message_to_send = Outbound::Bytes(buffer);
        }
        Ok(())
    }

    fn receive(&mut self, _context: &mut ReceiveContext<'_, Vec<u8>>) -> Result<bool, FramingError> {
        Ok(true)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Envelope {
    /// Correlates a response with its request.
    pub key: Option<String>,
    pub body: Vec<u8>,
    /// Masks the encoded envelope in diagnostic dumps.
    pub sensitive: bool,
}

impl Envelope {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            body: body.into(),
            sensitive: false,
        }
    }

    pub fn keyed(key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(body)
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

impl From<Vec<u8>> for Envelope {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

#[derive(Clone)]
pub struct FramedPipeline {
    max_frame_size: usize,
    config: Configuration<BigEndian, Fixint, Limit<MAX_FRAME_SIZE>>,
}

impl std::fmt::Debug for FramedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedPipeline")
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl FramedPipeline {
    /// Frames larger than `max_frame_size` are refused in both directions.
    /// The size is capped at [`MAX_FRAME_SIZE`].
    pub fn new(max_frame_size: usize) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_FRAME_SIZE>();
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
            config,
        }
    }
}

impl Default for FramedPipeline {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Pipeline for FramedPipeline {
    type Message = Envelope;

    fn send(&mut self, context: &mut SendContext<Envelope>) -> Result<(), FramingError> {
        let Some(envelope) = context.take_message() else {
            return Ok(());
        };

        let body = bincode::encode_to_vec(&envelope, self.config)?;
        if body.len() > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size: body.len(),
                limit: self.max_frame_size,
            });
        }

        let mut buffer = context.buffer();
        buffer.write(false, &body)?;
        if envelope.sensitive {
            buffer.secure_data(0, body.len())?;
        }
        buffer.write(true, &(body.len() as u32).to_be_bytes())?;

        context.message_to_send = Outbound::Bytes(buffer);
        Ok(())
    }

    fn receive(&mut self, context: &mut ReceiveContext<'_, Envelope>) -> Result<bool, FramingError> {
        let buffer = &mut *context.received_message;
        if buffer.len() < HEADER_LEN {
            context.expected_bytes = HEADER_LEN as isize;
            return Ok(false);
        }

        let mut header = [0; HEADER_LEN];
        header.copy_from_slice(buffer.peek(HEADER_LEN)?);
        let size = u32::from_be_bytes(header) as usize;
        if size > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + size;
        if buffer.len() < total {
            context.expected_bytes = total as isize;
            return Ok(false);
        }

        buffer.discard(HEADER_LEN)?;
        let body = buffer.read(true, size)?;
        let (envelope, _) = bincode::decode_from_slice(&body, self.config)?;

        context.message = Some(envelope);
        context.expected_bytes = 0;
        Ok(true)
    }

    fn correlation_key(&self, message: &Envelope) -> Option<String> {
        message.key.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bincode::error::DecodeError;

    use crate::buffer::{
        SecureBuffer,
        pool::{ChunkPool, TrivialPool},
    };

    use super::*;

    fn encode(pipeline: &mut FramedPipeline, pool: &Arc<dyn ChunkPool>, envelope: Envelope) -> SecureBuffer {
        let mut context = SendContext::new(envelope, Arc::clone(pool));
        pipeline.send(&mut context).unwrap();
        match context.message_to_send {
            Outbound::Bytes(buffer) => buffer,
            other => panic!("unexpected outbound {other:?}"),
        }
    }

    fn decode(pipeline: &mut FramedPipeline, buffer: &mut SecureBuffer) -> (bool, isize, Option<Envelope>) {
        let mut context = ReceiveContext {
            received_message: buffer,
            expected_bytes: 0,
            message: None,
        };
        let complete = pipeline.receive(&mut context).unwrap();
        (complete, context.expected_bytes, context.message)
    }

    #[test]
    fn frame_carries_length_prefix() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(32));
        let mut pipeline = FramedPipeline::default();

        let mut buffer = encode(&mut pipeline, &pool, Envelope::keyed("0001", b"ping".to_vec()));
        let header = buffer.peek(HEADER_LEN).unwrap().to_vec();
        assert_eq!(
            u32::from_be_bytes(header.try_into().unwrap()) as usize,
            buffer.len() - HEADER_LEN
        );

        let (complete, expected, message) = decode(&mut pipeline, &mut buffer);
        assert!(complete);
        assert_eq!(expected, 0);
        let message = message.unwrap();
        assert_eq!(pipeline.correlation_key(&message).as_deref(), Some("0001"));
        assert_eq!(message.body, b"ping");
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frame_asks_for_more() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(32));
        let mut pipeline = FramedPipeline::default();
        let frame = encode(&mut pipeline, &pool, Envelope::new(b"payload".to_vec()));
        let bytes = frame.peek(frame.len()).unwrap().to_vec();

        let mut buffer = SecureBuffer::from_bytes(Arc::clone(&pool), &bytes[..2]).unwrap();
        assert_eq!(decode(&mut pipeline, &mut buffer).1, HEADER_LEN as isize);

        buffer.write(false, &bytes[2..6]).unwrap();
        let (complete, expected, _) = decode(&mut pipeline, &mut buffer);
        assert!(!complete);
        assert_eq!(expected, bytes.len() as isize);

        buffer.write(false, &bytes[6..]).unwrap();
        let (complete, _, message) = decode(&mut pipeline, &mut buffer);
        assert!(complete);
        assert_eq!(message.unwrap().body, b"payload");
    }

    #[test]
    fn back_to_back_frames() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(64));
        let mut pipeline = FramedPipeline::default();
        let first = encode(&mut pipeline, &pool, Envelope::new(b"one".to_vec()));
        let second = encode(&mut pipeline, &pool, Envelope::new(b"two".to_vec()));

        let mut buffer = SecureBuffer::from_bytes(Arc::clone(&pool), first.peek(first.len()).unwrap()).unwrap();
        buffer.write(false, second.peek(second.len()).unwrap()).unwrap();

        assert_eq!(decode(&mut pipeline, &mut buffer).2.unwrap().body, b"one");
        assert_eq!(decode(&mut pipeline, &mut buffer).2.unwrap().body, b"two");
        assert!(buffer.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(32));
        let mut pipeline = FramedPipeline::new(8);
        let mut buffer = SecureBuffer::from_bytes(pool, &1024u32.to_be_bytes()).unwrap();

        let mut context = ReceiveContext {
            received_message: &mut buffer,
            expected_bytes: 0,
            message: None,
        };
        assert!(matches!(
            pipeline.receive(&mut context),
            Err(FramingError::FrameTooLarge { size: 1024, limit: 8 })
        ));
    }

    #[test]
    fn declared_length_beyond_the_frame_is_refused() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(32));
        let mut pipeline = FramedPipeline::default();
        // 10-byte frame: no key, then a body claiming 2^62 bytes.
        let frame = [0, 0, 0, 10, 0, 0x40, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut buffer = SecureBuffer::from_bytes(pool, &frame).unwrap();

        let mut context = ReceiveContext {
            received_message: &mut buffer,
            expected_bytes: 0,
            message: None,
        };
        assert!(matches!(
            pipeline.receive(&mut context),
            Err(FramingError::Decode(DecodeError::LimitExceeded))
        ));
    }

    #[test]
    fn frame_size_is_capped() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(32));
        let mut pipeline = FramedPipeline::new(usize::MAX);
        let oversized = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut buffer = SecureBuffer::from_bytes(pool, &oversized).unwrap();

        let mut context = ReceiveContext {
            received_message: &mut buffer,
            expected_bytes: 0,
            message: None,
        };
        assert!(matches!(
            pipeline.receive(&mut context),
            Err(FramingError::FrameTooLarge { limit: MAX_FRAME_SIZE, .. })
        ));
    }

    #[test]
    fn sensitive_envelope_is_masked() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(32));
        let mut pipeline = FramedPipeline::default();

        let buffer = encode(&mut pipeline, &pool, Envelope::new(b"4111".to_vec()).sensitive());

        assert!(!buffer.in_secure_region(buffer.lower_bound()));
        assert!(buffer.in_secure_region(buffer.lower_bound() + HEADER_LEN));
        assert!(buffer.in_secure_region(buffer.upper_bound() - 1));
    }

    #[test]
    fn raw_pipeline_copies_bytes() {
        let pool: Arc<dyn ChunkPool> = Arc::new(TrivialPool::new(32));
        let mut context = SendContext::new(b"raw".to_vec(), pool);

        RawPipeline.send(&mut context).unwrap();

        match context.message_to_send {
            Outbound::Bytes(buffer) => assert_eq!(buffer.peek(3).unwrap(), b"raw"),
            other => panic!("unexpected outbound {other:?}"),
        }
    }
}
