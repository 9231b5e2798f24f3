// Per-chain ordering: duplicate suppression and gap detection on the
// real-time feed.
use rill_wire::{MessageId, MessageRef, StreamMessage};

/// Identifies one publisher chain within a partition.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChainKey {
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl ChainKey {
    pub fn of(message_id: &MessageId) -> Self {
        Self {
            publisher_id: message_id.publisher_id.clone(),
            msg_chain_id: message_id.msg_chain_id.clone(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Deliver,
    /// Duplicate or out-of-date; dropped silently.
    Drop,
    /// Delivered, and a fill request for `[from, to]` should be issued.
    DeliverWithGap { from: MessageRef, to: MessageRef },
}

/// Tracks the last delivered ref for one chain and coalesces gap fills:
/// at most one fill request is outstanding per chain, later gaps extend a
/// pending coverage range that is re-issued once the in-flight fill ends.
#[derive(Debug, Default)]
pub(crate) struct ChainTracker {
    last_ref: Option<MessageRef>,
    fill_in_flight: bool,
    pending_fill: Option<(MessageRef, MessageRef)>,
}

impl ChainTracker {
    pub(crate) fn observe(&mut self, message: &StreamMessage) -> Verdict {
        let msg_ref = message.msg_ref();
        let Some(last) = self.last_ref else {
            self.last_ref = Some(msg_ref);
            return Verdict::Deliver;
        };
        if message.prev_msg_ref == Some(last) {
            self.last_ref = Some(msg_ref);
            return Verdict::Deliver;
        }
        if msg_ref <= last {
            return Verdict::Drop;
        }
        self.last_ref = Some(msg_ref);
        // A message without a back-link cannot define a gap; treat it as a
        // chain restart.
        let Some(prev) = message.prev_msg_ref else {
            return Verdict::Deliver;
        };
        let from = last.successor();
        let to = prev;
        if to < from {
            return Verdict::Deliver;
        }
        if self.fill_in_flight {
            self.extend_pending(from, to);
            return Verdict::Deliver;
        }
        self.fill_in_flight = true;
        Verdict::DeliverWithGap { from, to }
    }

    /// Records a gap discovered outside the live feed (resend/live merge).
    /// Returns the range to request now, or None if an in-flight fill
    /// absorbed it.
    pub(crate) fn request_fill(&mut self, from: MessageRef, to: MessageRef) -> Option<(MessageRef, MessageRef)> {
        if self.fill_in_flight {
            self.extend_pending(from, to);
            return None;
        }
        self.fill_in_flight = true;
        Some((from, to))
    }

    /// Terminal response for the in-flight fill arrived. Returns the
    /// coalesced coverage range to re-issue (the tracker stays in flight),
    /// or None when the chain is repaired.
    pub(crate) fn fill_completed(&mut self) -> Option<(MessageRef, MessageRef)> {
        match self.pending_fill.take() {
            Some(range) => Some(range),
            None => {
                self.fill_in_flight = false;
                None
            }
        }
    }

    /// Forget in-flight fill state (the request died with the connection).
    pub(crate) fn reset_fill(&mut self) {
        self.fill_in_flight = false;
        self.pending_fill = None;
    }

    fn extend_pending(&mut self, from: MessageRef, to: MessageRef) {
        let merged = match self.pending_fill.take() {
            Some((pending_from, pending_to)) => (pending_from.min(from), pending_to.max(to)),
            None => (from, to),
        };
        self.pending_fill = Some(merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_wire::StreamId;

    fn msg(timestamp: i64, seq: i32, prev: Option<(i64, i32)>) -> StreamMessage {
        StreamMessage {
            message_id: MessageId {
                stream_id: StreamId::new("s1").expect("stream id"),
                stream_partition: 0,
                timestamp,
                sequence_number: seq,
                publisher_id: "ab".into(),
                msg_chain_id: "main".into(),
            },
            prev_msg_ref: prev.map(|(t, s)| MessageRef::new(t, s)),
            content: "{}".into(),
            content_type: Default::default(),
            encryption_type: Default::default(),
            signature_type: Default::default(),
            signature: None,
        }
    }

    #[test]
    fn first_message_delivers_and_sets_last_ref() {
        let mut tracker = ChainTracker::default();
        assert_eq!(tracker.observe(&msg(1, 0, None)), Verdict::Deliver);
    }

    #[test]
    fn chained_messages_deliver() {
        let mut tracker = ChainTracker::default();
        tracker.observe(&msg(1, 0, None));
        assert_eq!(tracker.observe(&msg(2, 0, Some((1, 0)))), Verdict::Deliver);
        assert_eq!(tracker.observe(&msg(2, 1, Some((2, 0)))), Verdict::Deliver);
    }

    #[test]
    fn duplicates_and_stale_messages_drop() {
        let mut tracker = ChainTracker::default();
        tracker.observe(&msg(5, 0, None));
        assert_eq!(tracker.observe(&msg(5, 0, None)), Verdict::Drop);
        assert_eq!(tracker.observe(&msg(3, 0, Some((2, 0)))), Verdict::Drop);
    }

    #[test]
    fn gap_emits_inclusive_fill_range() {
        let mut tracker = ChainTracker::default();
        tracker.observe(&msg(1, 0, None));
        // Missing (1,1)..=(3,0): the back-link names (3,0) as the direct
        // predecessor, so it bounds the fill range inclusively.
        let verdict = tracker.observe(&msg(5, 0, Some((3, 0))));
        assert_eq!(
            verdict,
            Verdict::DeliverWithGap {
                from: MessageRef::new(1, 1),
                to: MessageRef::new(3, 0),
            }
        );
    }

    #[test]
    fn second_gap_coalesces_while_fill_is_in_flight() {
        let mut tracker = ChainTracker::default();
        tracker.observe(&msg(1, 0, None));
        assert!(matches!(
            tracker.observe(&msg(5, 0, Some((3, 0)))),
            Verdict::DeliverWithGap { .. }
        ));
        // Further gaps on the same chain deliver without a second request.
        assert_eq!(tracker.observe(&msg(9, 0, Some((7, 0)))), Verdict::Deliver);
        // The in-flight fill completes; the coalesced range comes back once.
        let extended = tracker.fill_completed().expect("extended range");
        assert_eq!(extended, (MessageRef::new(5, 1), MessageRef::new(7, 0)));
        // And after the re-issued fill completes, the chain is repaired.
        assert!(tracker.fill_completed().is_none());
        assert!(!tracker.fill_in_flight);
    }

    #[test]
    fn chain_restart_without_back_link_does_not_gap() {
        let mut tracker = ChainTracker::default();
        tracker.observe(&msg(1, 0, None));
        assert_eq!(tracker.observe(&msg(10, 0, None)), Verdict::Deliver);
    }

    #[test]
    fn adjacent_refs_do_not_produce_an_inverted_range() {
        let mut tracker = ChainTracker::default();
        tracker.observe(&msg(1, 0, None));
        // prev (1,0) matches last; plain advance, no gap possible.
        assert_eq!(tracker.observe(&msg(1, 1, Some((1, 0)))), Verdict::Deliver);
        // prev < last with a newer ref: inverted range, deliver without fill.
        assert_eq!(tracker.observe(&msg(4, 0, Some((0, 0)))), Verdict::Deliver);
    }

    #[test]
    fn request_fill_respects_in_flight_state() {
        let mut tracker = ChainTracker::default();
        let first = tracker.request_fill(MessageRef::new(1, 1), MessageRef::new(2, 0));
        assert_eq!(first, Some((MessageRef::new(1, 1), MessageRef::new(2, 0))));
        let second = tracker.request_fill(MessageRef::new(3, 0), MessageRef::new(4, 0));
        assert!(second.is_none());
        let extended = tracker.fill_completed().expect("pending range");
        assert_eq!(extended, (MessageRef::new(3, 0), MessageRef::new(4, 0)));
    }
}
