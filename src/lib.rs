pub mod buffer;
pub mod cancel;
pub mod channel;
pub mod codec;
pub mod completion;
pub mod config;
pub mod directory;
pub mod error;
pub mod runtime;
pub mod space;
pub mod thread;
pub mod worker;

pub use buffer::{BufferError, SecureBuffer};
pub use cancel::CancellationToken;
pub use channel::{
    Channel, ConnectionState, Incoming,
    listener::Listener,
    pipeline::{ChannelEvent, Pipeline},
};
pub use codec::{Envelope, FramedPipeline, RawPipeline};
pub use completion::{CompletionControl, Outcome, Request};
pub use config::ChannelConfig;
pub use error::Error;
pub use runtime::Runtime;
pub use space::{Context, TupleSpace};
pub use worker::Worker;
