// Client-facing error kinds.
use rill_wire::ErrorCode;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Well-formed frame with unexpected content; the frame is dropped and
    /// no subscription state changes.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker answered a pending request with an `ErrorResponse`.
    #[error("request failed ({code}): {message}")]
    RequestFailed { code: ErrorCode, message: String },
    /// A frame could not be parsed by the transport.
    #[error("decode error: {0}")]
    Decode(String),
    /// The connection dropped while an operation was pending.
    #[error("connection lost")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
    /// Invalid options at construction or subscribe time. Fatal for that
    /// call only.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// User-initiated cancellation.
    #[error("operation aborted")]
    Aborted,
    #[error("request timed out")]
    Timeout,
    /// Session-token acquisition failed.
    #[error("authentication failed: {0}")]
    Authentication(String),
}
