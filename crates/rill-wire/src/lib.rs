// Typed wire model for the rill control protocol.
pub mod control;
pub mod stream;

pub use control::{ControlMessage, ErrorCode, MessageKind, RequestId};
pub use stream::{
    ContentType, EncryptionType, MessageId, MessageRef, SignatureType, StreamId, StreamMessage,
};

pub const PROTOCOL_VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),
    #[error("encode control message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode control message: {0}")]
    Decode(#[source] serde_json::Error),
}
