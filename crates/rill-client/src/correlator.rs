// Pending-request table: matches correlated responses back to the
// operation that sent the request.
use std::collections::HashMap;
use tokio::sync::oneshot;

use rill_wire::{ControlMessage, MessageKind, RequestId};

use crate::error::{ClientError, Result};
use crate::ordering::ChainKey;
use crate::subscription::{SubId, SubscriptionKey};

pub(crate) const SUBSCRIBE_EXPECTED: &[MessageKind] = &[MessageKind::SubscribeResponse];
pub(crate) const UNSUBSCRIBE_EXPECTED: &[MessageKind] = &[MessageKind::UnsubscribeResponse];
// The terminal ResendResponseResent is observed by the resend episode, not
// by the correlator; only the initial ack pair is expected here.
pub(crate) const RESEND_EXPECTED: &[MessageKind] = &[
    MessageKind::ResendResponseResending,
    MessageKind::ResendResponseNoResend,
];

/// What the engine should do once the response (or error) arrives.
#[derive(Debug)]
pub(crate) enum RequestContext {
    Subscribe {
        key: SubscriptionKey,
    },
    Unsubscribe {
        key: SubscriptionKey,
    },
    Resend {
        sub_id: SubId,
    },
    GapFill {
        key: SubscriptionKey,
        chain: ChainKey,
    },
}

pub(crate) struct PendingRequest {
    pub(crate) request_id: RequestId,
    pub(crate) expected: &'static [MessageKind],
    pub(crate) context: RequestContext,
    /// Caller waiting on the terminal outcome (unsubscribe round trips).
    pub(crate) notify: Option<oneshot::Sender<Result<()>>>,
}

impl PendingRequest {
    pub(crate) fn notify(&mut self, outcome: Result<()>) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(outcome);
        }
    }
}

pub(crate) enum Correlation {
    /// A waiter expected this message; it has been removed from the table.
    Resolved {
        pending: PendingRequest,
        response: ControlMessage,
    },
    /// A waiter was terminated by a matching `ErrorResponse`.
    Rejected {
        pending: PendingRequest,
        error: ClientError,
    },
    /// No waiter claimed the message.
    Unclaimed(ControlMessage),
}

#[derive(Default)]
pub(crate) struct RequestCorrelator {
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestCorrelator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, pending: PendingRequest) {
        self.pending.insert(pending.request_id.clone(), pending);
        metrics::gauge!("rill_client_pending_requests").set(self.pending.len() as f64);
    }

    /// Routes one inbound message. A response whose kind is not expected by
    /// its waiter leaves the waiter in place (e.g. a `ResendResponseResent`
    /// passing through to the episode).
    pub(crate) fn on_inbound(&mut self, message: ControlMessage) -> Correlation {
        let Some(request_id) = message.request_id() else {
            return Correlation::Unclaimed(message);
        };
        let Some(pending) = self.pending.get(request_id) else {
            return Correlation::Unclaimed(message);
        };
        if pending.expected.contains(&message.kind()) {
            let pending = self.remove(&request_id.clone()).expect("pending present");
            return Correlation::Resolved {
                pending,
                response: message,
            };
        }
        if let ControlMessage::ErrorResponse {
            error_code,
            error_message,
            ..
        } = &message
        {
            let error = ClientError::RequestFailed {
                code: *error_code,
                message: error_message.clone(),
            };
            let pending = self.remove(&request_id.clone()).expect("pending present");
            return Correlation::Rejected { pending, error };
        }
        Correlation::Unclaimed(message)
    }

    pub(crate) fn remove(&mut self, request_id: &RequestId) -> Option<PendingRequest> {
        let removed = self.pending.remove(request_id);
        metrics::gauge!("rill_client_pending_requests").set(self.pending.len() as f64);
        removed
    }

    pub(crate) fn contains(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Drains every waiter; used when the connection drops.
    pub(crate) fn fail_all(&mut self) -> Vec<PendingRequest> {
        let drained = self.pending.drain().map(|(_, pending)| pending).collect();
        metrics::gauge!("rill_client_pending_requests").set(0.0);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_wire::{ErrorCode, StreamId};

    fn key() -> SubscriptionKey {
        SubscriptionKey {
            stream_id: StreamId::new("s1").expect("stream id"),
            partition: 0,
        }
    }

    fn subscribe_pending(id: &str) -> PendingRequest {
        PendingRequest {
            request_id: RequestId::new(id),
            expected: SUBSCRIBE_EXPECTED,
            context: RequestContext::Subscribe { key: key() },
            notify: None,
        }
    }

    fn subscribe_response(id: &str) -> ControlMessage {
        ControlMessage::SubscribeResponse {
            request_id: RequestId::new(id),
            stream_id: StreamId::new("s1").expect("stream id"),
            stream_partition: 0,
        }
    }

    #[test]
    fn expected_response_resolves_and_removes() {
        let mut correlator = RequestCorrelator::new();
        correlator.register(subscribe_pending("r1"));
        match correlator.on_inbound(subscribe_response("r1")) {
            Correlation::Resolved { pending, .. } => {
                assert_eq!(pending.request_id, RequestId::new("r1"));
            }
            _ => panic!("expected resolution"),
        }
        assert!(!correlator.contains(&RequestId::new("r1")));
    }

    #[test]
    fn error_response_rejects_the_waiter() {
        let mut correlator = RequestCorrelator::new();
        correlator.register(subscribe_pending("r1"));
        let error = ControlMessage::ErrorResponse {
            request_id: Some(RequestId::new("r1")),
            error_code: ErrorCode::PermissionDenied,
            error_message: "nope".into(),
        };
        match correlator.on_inbound(error) {
            Correlation::Rejected { error, .. } => {
                assert!(matches!(error, ClientError::RequestFailed { .. }));
            }
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn unexpected_kind_leaves_the_waiter_pending() {
        let mut correlator = RequestCorrelator::new();
        correlator.register(PendingRequest {
            request_id: RequestId::new("r2"),
            expected: RESEND_EXPECTED,
            context: RequestContext::Resend { sub_id: 1 },
            notify: None,
        });
        // Resent is terminal for the episode, not for this waiter.
        let resent = ControlMessage::ResendResponseResent {
            request_id: RequestId::new("r2"),
            stream_id: StreamId::new("s1").expect("stream id"),
            stream_partition: 0,
        };
        match correlator.on_inbound(resent) {
            Correlation::Unclaimed(_) => {}
            _ => panic!("waiter should remain"),
        }
        assert!(correlator.contains(&RequestId::new("r2")));
    }

    #[test]
    fn unmatched_request_id_is_unclaimed() {
        let mut correlator = RequestCorrelator::new();
        match correlator.on_inbound(subscribe_response("r9")) {
            Correlation::Unclaimed(_) => {}
            _ => panic!("nothing registered"),
        }
    }

    #[test]
    fn fail_all_drains_every_waiter() {
        let mut correlator = RequestCorrelator::new();
        correlator.register(subscribe_pending("r1"));
        correlator.register(subscribe_pending("r2"));
        assert_eq!(correlator.fail_all().len(), 2);
        assert!(!correlator.contains(&RequestId::new("r1")));
    }
}
