// Subscription records and the partition index.
//
// The registry owns every per-subscription record and one PartitionEntry
// per `(streamId, partition)`, so the broker sees at most one on-wire
// subscription per partition no matter how many logical subscribers exist.
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rill_wire::{MessageRef, RequestId, StreamId, StreamMessage};

use crate::ordering::{ChainKey, ChainTracker, Verdict};
use crate::resend::ResendOption;
use crate::subscription::{SubId, SubState, SubscriptionEvent, SubscriptionKey};

/// Engine-side record for one logical subscription.
pub(crate) struct SubRecord {
    pub(crate) id: SubId,
    pub(crate) key: SubscriptionKey,
    pub(crate) state: SubState,
    pub(crate) events: mpsc::Sender<SubscriptionEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) resend: Option<ResendOption>,
    /// Pure resend, no live leg; never replayed on reconnect.
    pub(crate) historical_only: bool,
    /// The subscribe-time resend reached a terminal response once.
    pub(crate) resend_completed: bool,
    /// Request id of the in-flight subscribe-time resend episode.
    pub(crate) pending_resend: Option<RequestId>,
    /// Live messages held back while the resend episode runs.
    pub(crate) buffer: VecDeque<StreamMessage>,
    /// Last ref delivered per chain within the resend episode, for the
    /// resent/live merge dedup.
    pub(crate) delivered: HashMap<ChainKey, MessageRef>,
}

impl SubRecord {
    /// Pushes one event to the handle. Returns false when the handle is
    /// gone or the subscription was cancelled; a full queue drops the
    /// event rather than stalling the engine.
    pub(crate) fn emit(&self, event: SubscriptionEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(key = %self.key, "subscription event queue full; dropping {event:?}");
                metrics::counter!("rill_client_events_dropped_total").increment(1);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether live messages should be buffered instead of delivered.
    pub(crate) fn buffering(&self) -> bool {
        self.pending_resend.is_some()
    }
}

pub(crate) struct PartitionEntry {
    pub(crate) key: SubscriptionKey,
    pub(crate) broker_subscribed: bool,
    pub(crate) subscribe_request: Option<RequestId>,
    pub(crate) unsubscribe_request: Option<RequestId>,
    pub(crate) members: Vec<SubId>,
    /// Last-seen refs and gap state per chain, shared by every member.
    pub(crate) chains: HashMap<ChainKey, ChainTracker>,
}

impl PartitionEntry {
    fn new(key: SubscriptionKey) -> Self {
        Self {
            key,
            broker_subscribed: false,
            subscribe_request: None,
            unsubscribe_request: None,
            members: Vec::new(),
            chains: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<SubscriptionKey, PartitionEntry>,
    subs: HashMap<SubId, SubRecord>,
    next_sub_id: SubId,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_id(&mut self) -> SubId {
        self.next_sub_id += 1;
        self.next_sub_id
    }

    pub(crate) fn insert(&mut self, record: SubRecord) {
        self.subs.insert(record.id, record);
    }

    pub(crate) fn sub(&self, id: SubId) -> Option<&SubRecord> {
        self.subs.get(&id)
    }

    pub(crate) fn sub_mut(&mut self, id: SubId) -> Option<&mut SubRecord> {
        self.subs.get_mut(&id)
    }

    pub(crate) fn remove_sub(&mut self, id: SubId) -> Option<SubRecord> {
        self.subs.remove(&id)
    }

    pub(crate) fn entry(&self, key: &SubscriptionKey) -> Option<&PartitionEntry> {
        self.entries.get(key)
    }

    pub(crate) fn entry_mut(&mut self, key: &SubscriptionKey) -> Option<&mut PartitionEntry> {
        self.entries.get_mut(key)
    }

    pub(crate) fn entry_or_create(&mut self, key: &SubscriptionKey) -> &mut PartitionEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| PartitionEntry::new(key.clone()))
    }

    pub(crate) fn remove_entry(&mut self, key: &SubscriptionKey) -> Option<PartitionEntry> {
        self.entries.remove(key)
    }

    pub(crate) fn members(&self, key: &SubscriptionKey) -> Vec<SubId> {
        self.entries
            .get(key)
            .map(|entry| entry.members.clone())
            .unwrap_or_default()
    }

    /// Removes one member; returns how many remain, or None when the entry
    /// does not exist.
    pub(crate) fn remove_member(&mut self, key: &SubscriptionKey, id: SubId) -> Option<usize> {
        let entry = self.entries.get_mut(key)?;
        entry.members.retain(|member| *member != id);
        Some(entry.members.len())
    }

    /// Every subscription record on `stream_id`, any partition.
    pub(crate) fn subs_on_stream(&self, stream_id: &StreamId) -> Vec<SubId> {
        self.subs
            .values()
            .filter(|record| record.key.stream_id == *stream_id)
            .map(|record| record.id)
            .collect()
    }

    /// Partition keys to re-subscribe after a reconnect: one per entry with
    /// at least one live member.
    pub(crate) fn replay_keys(&self) -> Vec<SubscriptionKey> {
        self.entries
            .values()
            .filter(|entry| !entry.members.is_empty())
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Historical-only records still waiting for the connection.
    pub(crate) fn pending_historical(&self) -> Vec<SubId> {
        self.subs
            .values()
            .filter(|record| record.historical_only && record.state == SubState::Pending)
            .map(|record| record.id)
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Applies one live message to the partition's chain tracker and
    /// returns the ordering verdict plus the member fan-out list.
    pub(crate) fn observe(
        &mut self,
        key: &SubscriptionKey,
        message: &StreamMessage,
    ) -> Option<(Verdict, Vec<SubId>)> {
        let entry = self.entries.get_mut(key)?;
        let chain = ChainKey::of(&message.message_id);
        let tracker = entry.chains.entry(chain).or_default();
        let verdict = tracker.observe(message);
        Some((verdict, entry.members.clone()))
    }

    pub(crate) fn tracker_mut(
        &mut self,
        key: &SubscriptionKey,
        chain: &ChainKey,
    ) -> Option<&mut ChainTracker> {
        self.entries.get_mut(key)?.chains.get_mut(chain)
    }

    /// Ask the chain tracker to admit a fill for `[from, to]`; returns the
    /// range to request now, or None if an in-flight fill absorbed it.
    pub(crate) fn request_fill(
        &mut self,
        key: &SubscriptionKey,
        chain: &ChainKey,
        from: MessageRef,
        to: MessageRef,
    ) -> Option<(MessageRef, MessageRef)> {
        let entry = self.entries.get_mut(key)?;
        entry
            .chains
            .entry(chain.clone())
            .or_default()
            .request_fill(from, to)
    }

    /// Connection dropped: partition subscriptions are gone on the broker
    /// side, in-flight requests died, chain last-refs survive so the gap
    /// detector can repair the outage span after the replay.
    pub(crate) fn on_disconnect(&mut self) {
        for entry in self.entries.values_mut() {
            entry.broker_subscribed = false;
            entry.subscribe_request = None;
            entry.unsubscribe_request = None;
            for tracker in entry.chains.values_mut() {
                tracker.reset_fill();
            }
        }
        for record in self.subs.values_mut() {
            if !record.historical_only {
                record.state = SubState::Unsubscribed;
                record.pending_resend = None;
                record.buffer.clear();
                record.delivered.clear();
            }
        }
    }
}
