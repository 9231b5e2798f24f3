// Stream-message data model: ids, ordering refs, and the signed record itself.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Name of a partitioned, append-only stream.
///
/// ```
/// use rill_wire::StreamId;
///
/// let id = StreamId::new("metrics").expect("stream id");
/// assert_eq!(id.as_str(), "metrics");
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidStreamId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::new(input)
    }
}

/// Ordering key of a message within a chain: `(timestamp, sequenceNumber)`.
///
/// Total order is lexicographic, which the derived `Ord` provides given the
/// field order below.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub timestamp: i64,
    pub sequence_number: i32,
}

impl MessageRef {
    pub fn new(timestamp: i64, sequence_number: i32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }

    /// Next ref within the same timestamp.
    pub fn successor(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number + 1,
        }
    }

    /// Previous ref within the same timestamp.
    pub fn predecessor(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number - 1,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.sequence_number)
    }
}

/// Full identity of a published message.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageId {
    pub stream_id: StreamId,
    pub stream_partition: u32,
    pub timestamp: i64,
    pub sequence_number: i32,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn msg_ref(&self) -> MessageRef {
        MessageRef {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Json,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    #[default]
    None,
    Aes,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    #[default]
    None,
    Ed25519,
}

/// Immutable signed record delivered on a stream partition.
///
/// Within a chain `(streamId, partition, publisherId, msgChainId)` the pair
/// `(timestamp, sequenceNumber)` is strictly increasing, and `prev_msg_ref`
/// is either `None` (chain origin) or the ref of the previous message in
/// that chain.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub message_id: MessageId,
    pub prev_msg_ref: Option<MessageRef>,
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub encryption_type: EncryptionType,
    #[serde(default)]
    pub signature_type: SignatureType,
    pub signature: Option<String>,
}

impl StreamMessage {
    pub fn msg_ref(&self) -> MessageRef {
        self.message_id.msg_ref()
    }
}
