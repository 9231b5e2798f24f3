// Ed25519 signing and verification for stream messages.
use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use rill_wire::{MessageId, MessageRef, SignatureType, StreamMessage};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid signing key: {0}")]
    InvalidSigningKey(String),
    #[error("invalid publisher id: {0}")]
    InvalidPublisherId(String),
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("unsupported signature type: {0:?}")]
    UnsupportedSignatureType(SignatureType),
}

/// Ed25519 signature in byte form, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        Signature::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}

impl Signature {
    pub fn from_hex(input: &str) -> Result<Self> {
        let bytes = hex::decode(input).map_err(|err| Error::InvalidSignature(err.to_string()))?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::InvalidSignature("signature must be 64 bytes".into()))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Ed25519 signing key wrapper.
///
/// ```
/// use rill_crypto::SigningKey;
///
/// let key = SigningKey::from_bytes([7u8; 32]);
/// let publisher = key.publisher_id();
/// assert_eq!(publisher, publisher.to_lowercase());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(input: &str) -> Result<Self> {
        let bytes = hex::decode(input).map_err(|err| Error::InvalidSigningKey(err.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidSigningKey("signing key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    pub fn generate(rng: &mut (impl rand_core::CryptoRngCore + ?Sized)) -> Self {
        Self(ed25519_dalek::SigningKey::generate(rng).to_bytes())
    }

    /// Publisher identity derived from the verifying key: lowercase hex.
    pub fn publisher_id(&self) -> String {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        hex::encode(key.verifying_key().to_bytes())
    }

    pub fn sign(&self, payload: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature(key.sign(payload).to_bytes())
    }
}

/// Canonical payload a publisher signs for one stream message.
///
/// Concatenates streamId, partition, timestamp, sequenceNumber, lowercased
/// publisherId, msgChainId, the previous ref when present, then the
/// serialized content.
pub fn signature_payload(
    message_id: &MessageId,
    prev_msg_ref: Option<&MessageRef>,
    content: &str,
) -> Vec<u8> {
    let mut payload = String::new();
    payload.push_str(message_id.stream_id.as_str());
    payload.push_str(&message_id.stream_partition.to_string());
    payload.push_str(&message_id.timestamp.to_string());
    payload.push_str(&message_id.sequence_number.to_string());
    payload.push_str(&message_id.publisher_id.to_lowercase());
    payload.push_str(&message_id.msg_chain_id);
    if let Some(prev) = prev_msg_ref {
        payload.push_str(&prev.timestamp.to_string());
        payload.push_str(&prev.sequence_number.to_string());
    }
    payload.push_str(content);
    payload.into_bytes()
}

/// Sign `message` in place with `key`, stamping publisher id and signature.
pub fn sign_stream_message(message: &mut StreamMessage, key: &SigningKey) {
    message.message_id.publisher_id = key.publisher_id();
    let payload = signature_payload(
        &message.message_id,
        message.prev_msg_ref.as_ref(),
        &message.content,
    );
    message.signature_type = SignatureType::Ed25519;
    message.signature = Some(key.sign(&payload).to_hex());
}

/// Verify `message`'s signature against its publisher id.
///
/// Returns `Ok(false)` for a well-formed signature that does not match;
/// malformed keys or signatures are errors so callers can distinguish
/// garbage from forgery.
pub fn verify_stream_message(message: &StreamMessage) -> Result<bool> {
    match message.signature_type {
        SignatureType::Ed25519 => {}
        other => return Err(Error::UnsupportedSignatureType(other)),
    }
    let Some(signature_hex) = message.signature.as_deref() else {
        return Ok(false);
    };
    let signature = Signature::from_hex(signature_hex)?;
    let key_bytes = hex::decode(message.message_id.publisher_id.to_lowercase())
        .map_err(|err| Error::InvalidPublisherId(err.to_string()))?;
    let key_arr: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| Error::InvalidPublisherId("publisher id must be 32 bytes of hex".into()))?;
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(&key_arr)
        .map_err(|err| Error::InvalidPublisherId(err.to_string()))?;
    let payload = signature_payload(
        &message.message_id,
        message.prev_msg_ref.as_ref(),
        &message.content,
    );
    Ok(verifying
        .verify(&payload, &ed25519_dalek::Signature::from_bytes(&signature.0))
        .is_ok())
}
