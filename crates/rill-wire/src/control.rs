// Control-plane message envelope and its JSON codec.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stream::{MessageRef, StreamId, StreamMessage};
use crate::{Error, Result};

/// Opaque client-generated token correlating a request with its responses.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    PermissionDenied,
    NotFound,
    ResendFailed,
    Internal,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ResendFailed => "resend_failed",
            ErrorCode::Internal => "internal",
            ErrorCode::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Discriminant of a [`ControlMessage`], used for expected-response matching.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MessageKind {
    BroadcastMessage,
    UnicastMessage,
    SubscribeRequest,
    SubscribeResponse,
    UnsubscribeRequest,
    UnsubscribeResponse,
    ResendLastRequest,
    ResendFromRequest,
    ResendRangeRequest,
    ResendResponseResending,
    ResendResponseResent,
    ResendResponseNoResend,
    ErrorResponse,
}

/// Every message that can cross the client/broker boundary.
///
/// ```
/// use rill_wire::{ControlMessage, RequestId, StreamId};
///
/// let msg = ControlMessage::SubscribeRequest {
///     request_id: RequestId::new("r1"),
///     stream_id: StreamId::new("s1").expect("stream id"),
///     stream_partition: 0,
///     session_token: Some("token".into()),
/// };
/// let encoded = msg.encode().expect("encode");
/// let decoded = ControlMessage::decode(&encoded).expect("decode");
/// assert_eq!(msg, decoded);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Live delivery to all subscribers of a partition. Carries no request id.
    BroadcastMessage { stream_message: StreamMessage },
    /// Historical delivery for one specific resend request.
    UnicastMessage {
        request_id: RequestId,
        stream_message: StreamMessage,
    },
    SubscribeRequest {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
        #[serde(default)]
        session_token: Option<String>,
    },
    SubscribeResponse {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
    },
    UnsubscribeRequest {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
    },
    UnsubscribeResponse {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
    },
    ResendLastRequest {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
        number_last: u32,
        #[serde(default)]
        session_token: Option<String>,
    },
    ResendFromRequest {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
        from_msg_ref: MessageRef,
        #[serde(default)]
        publisher_id: Option<String>,
        #[serde(default)]
        msg_chain_id: Option<String>,
        #[serde(default)]
        session_token: Option<String>,
    },
    ResendRangeRequest {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
        from_msg_ref: MessageRef,
        to_msg_ref: MessageRef,
        #[serde(default)]
        publisher_id: Option<String>,
        #[serde(default)]
        msg_chain_id: Option<String>,
        #[serde(default)]
        session_token: Option<String>,
    },
    ResendResponseResending {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
    },
    ResendResponseResent {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
    },
    ResendResponseNoResend {
        request_id: RequestId,
        stream_id: StreamId,
        stream_partition: u32,
    },
    /// May terminate any pending request; an absent request id marks a
    /// connection-level error.
    ErrorResponse {
        #[serde(default)]
        request_id: Option<RequestId>,
        error_code: ErrorCode,
        error_message: String,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::BroadcastMessage { .. } => MessageKind::BroadcastMessage,
            ControlMessage::UnicastMessage { .. } => MessageKind::UnicastMessage,
            ControlMessage::SubscribeRequest { .. } => MessageKind::SubscribeRequest,
            ControlMessage::SubscribeResponse { .. } => MessageKind::SubscribeResponse,
            ControlMessage::UnsubscribeRequest { .. } => MessageKind::UnsubscribeRequest,
            ControlMessage::UnsubscribeResponse { .. } => MessageKind::UnsubscribeResponse,
            ControlMessage::ResendLastRequest { .. } => MessageKind::ResendLastRequest,
            ControlMessage::ResendFromRequest { .. } => MessageKind::ResendFromRequest,
            ControlMessage::ResendRangeRequest { .. } => MessageKind::ResendRangeRequest,
            ControlMessage::ResendResponseResending { .. } => MessageKind::ResendResponseResending,
            ControlMessage::ResendResponseResent { .. } => MessageKind::ResendResponseResent,
            ControlMessage::ResendResponseNoResend { .. } => MessageKind::ResendResponseNoResend,
            ControlMessage::ErrorResponse { .. } => MessageKind::ErrorResponse,
        }
    }

    /// Request id carried by this message, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ControlMessage::BroadcastMessage { .. } => None,
            ControlMessage::UnicastMessage { request_id, .. }
            | ControlMessage::SubscribeRequest { request_id, .. }
            | ControlMessage::SubscribeResponse { request_id, .. }
            | ControlMessage::UnsubscribeRequest { request_id, .. }
            | ControlMessage::UnsubscribeResponse { request_id, .. }
            | ControlMessage::ResendLastRequest { request_id, .. }
            | ControlMessage::ResendFromRequest { request_id, .. }
            | ControlMessage::ResendRangeRequest { request_id, .. }
            | ControlMessage::ResendResponseResending { request_id, .. }
            | ControlMessage::ResendResponseResent { request_id, .. }
            | ControlMessage::ResendResponseNoResend { request_id, .. } => Some(request_id),
            ControlMessage::ErrorResponse { request_id, .. } => request_id.as_ref(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from).map_err(Error::Encode)
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        serde_json::from_slice(input).map_err(Error::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_id() -> StreamId {
        StreamId::new("s1").expect("stream id")
    }

    #[test]
    fn subscribe_request_round_trip() {
        let msg = ControlMessage::SubscribeRequest {
            request_id: RequestId::new("r1"),
            stream_id: stream_id(),
            stream_partition: 3,
            session_token: Some("token".into()),
        };
        let encoded = msg.encode().expect("encode");
        let decoded = ControlMessage::decode(&encoded).expect("decode");
        assert_eq!(msg, decoded);
        assert_eq!(decoded.kind(), MessageKind::SubscribeRequest);
    }

    #[test]
    fn error_response_without_request_id() {
        let msg = ControlMessage::ErrorResponse {
            request_id: None,
            error_code: ErrorCode::Internal,
            error_message: "broker restarting".into(),
        };
        assert!(msg.request_id().is_none());
        let encoded = msg.encode().expect("encode");
        let decoded = ControlMessage::decode(&encoded).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn unknown_error_code_decodes_as_unknown() {
        let raw = br#"{"type":"errorResponse","requestId":"r9","errorCode":"weird_future_code","errorMessage":"?"}"#;
        let decoded = ControlMessage::decode(raw).expect("decode");
        match decoded {
            ControlMessage::ErrorResponse { error_code, .. } => {
                assert_eq!(error_code, ErrorCode::Unknown);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = ControlMessage::decode(b"not json").expect_err("garbage");
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn resend_range_round_trip() {
        let msg = ControlMessage::ResendRangeRequest {
            request_id: RequestId::new("r2"),
            stream_id: stream_id(),
            stream_partition: 0,
            from_msg_ref: MessageRef::new(1, 1),
            to_msg_ref: MessageRef::new(3, 0),
            publisher_id: Some("ab".into()),
            msg_chain_id: Some("chain".into()),
            session_token: None,
        };
        let encoded = msg.encode().expect("encode");
        assert_eq!(ControlMessage::decode(&encoded).expect("decode"), msg);
    }
}
