// Signature verification with a shared memo per delivered message.
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use rill_wire::{MessageRef, SignatureType, StreamId, StreamMessage};

use crate::config::SignaturePolicy;

// Opportunistic purge threshold for dead cache entries.
const PURGE_AT: usize = 256;

/// Identity of one delivered message.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct MessageKey {
    stream_id: StreamId,
    partition: u32,
    publisher_id: String,
    msg_chain_id: String,
    msg_ref: MessageRef,
}

impl MessageKey {
    fn of(message: &StreamMessage) -> Self {
        Self {
            stream_id: message.message_id.stream_id.clone(),
            partition: message.message_id.stream_partition,
            publisher_id: message.message_id.publisher_id.clone(),
            msg_chain_id: message.message_id.msg_chain_id.clone(),
            msg_ref: message.msg_ref(),
        }
    }
}

/// Shared verification result for one delivery. Every subscription handed
/// the same delivery holds the same `Arc`, so the check runs at most once.
#[derive(Default)]
pub(crate) struct VerificationHandle {
    result: OnceLock<bool>,
}

impl VerificationHandle {
    pub(crate) fn result(&self, message: &StreamMessage, policy: SignaturePolicy) -> bool {
        *self.result.get_or_init(|| evaluate(message, policy))
    }
}

fn evaluate(message: &StreamMessage, policy: SignaturePolicy) -> bool {
    match policy {
        SignaturePolicy::Never => true,
        SignaturePolicy::Auto => {
            if message.signature_type == SignatureType::None {
                return true;
            }
            checked_verify(message)
        }
        SignaturePolicy::Always => checked_verify(message),
    }
}

fn checked_verify(message: &StreamMessage) -> bool {
    match rill_crypto::verify_stream_message(message) {
        Ok(valid) => valid,
        Err(err) => {
            tracing::debug!(error = %err, "signature verification not possible");
            false
        }
    }
}

/// Weak memo cache keyed by message identity. Entries die with the last
/// consumer of the delivery and are purged lazily.
pub(crate) struct MessageVerifier {
    policy: SignaturePolicy,
    cache: HashMap<MessageKey, Weak<VerificationHandle>>,
}

impl MessageVerifier {
    pub(crate) fn new(policy: SignaturePolicy) -> Self {
        Self {
            policy,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn policy(&self) -> SignaturePolicy {
        self.policy
    }

    /// One handle per delivered message identity.
    pub(crate) fn handle(&mut self, message: &StreamMessage) -> Arc<VerificationHandle> {
        let key = MessageKey::of(message);
        if let Some(weak) = self.cache.get(&key)
            && let Some(handle) = weak.upgrade()
        {
            return handle;
        }
        if self.cache.len() >= PURGE_AT {
            self.cache.retain(|_, weak| weak.strong_count() > 0);
        }
        let handle = Arc::new(VerificationHandle::default());
        self.cache.insert(key, Arc::downgrade(&handle));
        handle
    }
}
