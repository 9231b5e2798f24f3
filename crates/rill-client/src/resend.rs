// Resend requests and episode bookkeeping.
//
// An episode runs from the moment a resend request is sent until its
// terminal response: `resending -> (unicast*) -> resent | no-resend`, or an
// error. Unicast routing is by episode request id.
use std::collections::HashMap;

use rill_wire::{ControlMessage, MessageRef, RequestId};

use crate::error::{ClientError, Result};
use crate::ordering::ChainKey;
use crate::subscription::{SubId, SubscriptionKey};

/// Historical delivery request attached to a subscription. At most one
/// variant per subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResendOption {
    /// The newest `count` stored messages.
    Last { count: u32 },
    /// Everything from `from` onward, optionally scoped to one chain.
    From {
        from: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
    /// A bounded range, optionally scoped to one chain.
    Range {
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
}

impl ResendOption {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            ResendOption::Last { count } => {
                if *count == 0 {
                    return Err(ClientError::Configuration(
                        "resend last: count must be positive".into(),
                    ));
                }
            }
            ResendOption::From { .. } => {}
            ResendOption::Range { from, to, .. } => {
                if to < from {
                    return Err(ClientError::Configuration(format!(
                        "resend range: from {from} is after to {to}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builds the on-wire request for one resend episode.
pub(crate) fn build_resend_request(
    option: &ResendOption,
    key: &SubscriptionKey,
    request_id: RequestId,
    session_token: Option<String>,
) -> ControlMessage {
    match option {
        ResendOption::Last { count } => ControlMessage::ResendLastRequest {
            request_id,
            stream_id: key.stream_id.clone(),
            stream_partition: key.partition,
            number_last: *count,
            session_token,
        },
        ResendOption::From {
            from,
            publisher_id,
            msg_chain_id,
        } => ControlMessage::ResendFromRequest {
            request_id,
            stream_id: key.stream_id.clone(),
            stream_partition: key.partition,
            from_msg_ref: *from,
            publisher_id: publisher_id.clone(),
            msg_chain_id: msg_chain_id.clone(),
            session_token,
        },
        ResendOption::Range {
            from,
            to,
            publisher_id,
            msg_chain_id,
        } => ControlMessage::ResendRangeRequest {
            request_id,
            stream_id: key.stream_id.clone(),
            stream_partition: key.partition,
            from_msg_ref: *from,
            to_msg_ref: *to,
            publisher_id: publisher_id.clone(),
            msg_chain_id: msg_chain_id.clone(),
            session_token,
        },
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum EpisodeKind {
    /// Subscribe-time (or historical-only) resend for one subscription.
    Initial { sub_id: SubId },
    /// Partition-level gap repair for one chain.
    GapFill {
        key: SubscriptionKey,
        chain: ChainKey,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EpisodePhase {
    AwaitingAck,
    Streaming,
}

pub(crate) struct Episode {
    pub(crate) kind: EpisodeKind,
    pub(crate) phase: EpisodePhase,
    pub(crate) option: ResendOption,
    /// Messages observed so far in this episode.
    pub(crate) seen: u64,
    /// Set when this episode is the silent storage-settle retry.
    pub(crate) is_retry: bool,
}

#[derive(Default)]
pub(crate) struct ResendCoordinator {
    episodes: HashMap<RequestId, Episode>,
}

impl ResendCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, request_id: RequestId, episode: Episode) {
        self.episodes.insert(request_id, episode);
    }

    pub(crate) fn get_mut(&mut self, request_id: &RequestId) -> Option<&mut Episode> {
        self.episodes.get_mut(request_id)
    }

    pub(crate) fn contains(&self, request_id: &RequestId) -> bool {
        self.episodes.contains_key(request_id)
    }

    pub(crate) fn remove(&mut self, request_id: &RequestId) -> Option<Episode> {
        self.episodes.remove(request_id)
    }

    /// Drops every episode belonging to `sub_id`, returning their ids.
    pub(crate) fn remove_for_sub(&mut self, sub_id: SubId) -> Vec<RequestId> {
        let ids: Vec<RequestId> = self
            .episodes
            .iter()
            .filter(|(_, episode)| episode.kind == EpisodeKind::Initial { sub_id })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.episodes.remove(id);
        }
        ids
    }

    /// Drains everything; used when the connection drops.
    pub(crate) fn drain(&mut self) -> Vec<(RequestId, Episode)> {
        self.episodes.drain().collect()
    }
}
