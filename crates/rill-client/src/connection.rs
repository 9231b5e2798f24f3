// Seam to the external wire connection.
//
// Framing, TLS, and reconnect backoff live outside this crate; the engine
// only needs to push typed messages out and observe typed events coming in.
use async_trait::async_trait;

use rill_wire::{ControlMessage, StreamId};

use crate::error::Result;

/// Outbound half of the wire connection.
///
/// Implementations must preserve per-sender ordering of `send` calls.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn send(&self, message: ControlMessage) -> Result<()>;
}

/// Inbound events, delivered on the receiver handed to the engine.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Message(ControlMessage),
    /// A frame could not be parsed. When the transport can attribute the
    /// frame to a stream, every subscription on that stream is told.
    DecodeError {
        stream_id: Option<StreamId>,
        error: String,
    },
}
