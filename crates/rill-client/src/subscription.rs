// User-facing subscription handle and its event model.
//
// The state machine itself lives with the engine; this handle consumes one
// ordered event stream and carries the cancellation token that guards every
// suspension point of the subscription.
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rill_wire::{MessageRef, StreamId, StreamMessage};

use crate::engine::Command;
use crate::error::{ClientError, Result};

/// Unit of broker-side subscription: `(streamId, partition)`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionKey {
    pub stream_id: StreamId,
    pub partition: u32,
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.partition)
    }
}

pub(crate) type SubId = u64;

/// Lifecycle states of one logical subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubState {
    Pending,
    Subscribing,
    Subscribed,
    Resending,
    ResendDone,
    Unsubscribing,
    Unsubscribed,
    Error,
}

/// Everything a subscription reports, in causal order: `Subscribed` before
/// any message, `Resending` before any resent message, `Resent`/`NoResend`
/// before subsequent live messages.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    Subscribed,
    Unsubscribed,
    Resending,
    Resent,
    NoResend,
    /// A missing `[from, to]` range was detected on a chain; a fill request
    /// has been issued.
    Gap {
        from: MessageRef,
        to: MessageRef,
        publisher_id: String,
        msg_chain_id: String,
    },
    /// One verified delivered message.
    Message(StreamMessage),
    /// The subscription naturally ended (bounded resend, no live leg).
    Done,
    Error(ClientError),
}

/// Handle for one logical subscription.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: SubId,
    pub(crate) key: SubscriptionKey,
    pub(crate) events: mpsc::Receiver<SubscriptionEvent>,
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) cancel: CancellationToken,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Token cancelled when this subscription ends, however it ends.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event, or None once the subscription is finished.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Graceful unsubscribe; resolves once the broker acknowledged (or no
    /// on-wire unsubscribe was needed). Safe to call repeatedly.
    pub async fn unsubscribe(&self) -> Result<()> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(Command::Unsubscribe {
                id: self.id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Aborted)?;
        reply_rx.await.map_err(|_| ClientError::Aborted)?
    }

    /// Abort immediately. Outstanding requests for this subscription are
    /// rejected and no further user events are delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.commands.try_send(Command::SubscriptionDropped { id: self.id });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            let _ = self.commands.try_send(Command::SubscriptionDropped { id: self.id });
        }
    }
}
