// Session-token acquisition: auth options, the provider seam, and the
// deduplicated token cache.
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use rill_crypto::SigningKey;

use crate::error::{ClientError, Result};

/// Credential options. Exactly one of session token, private key, API key,
/// or username+password must be supplied.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Auth {
    pub session_token: Option<String>,
    /// Hex-encoded Ed25519 signing key.
    pub private_key: Option<String>,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Auth {
    pub fn with_session_token(token: impl Into<String>) -> Self {
        Self {
            session_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn with_private_key(key_hex: impl Into<String>) -> Self {
        Self {
            private_key: Some(key_hex.into()),
            ..Self::default()
        }
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.username.is_some() != self.password.is_some() {
            return Err(ClientError::Configuration(
                "username and password must be supplied together".into(),
            ));
        }
        let supplied = [
            self.session_token.is_some(),
            self.private_key.is_some(),
            self.api_key.is_some(),
            self.username.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        match supplied {
            1 => Ok(()),
            0 => Err(ClientError::Configuration(
                "no credentials supplied: set one of session_token, private_key, api_key, username+password".into(),
            )),
            _ => Err(ClientError::Configuration(
                "multiple credentials supplied: set exactly one auth option".into(),
            )),
        }
    }
}

/// Exchanges credentials for a bearer session token. The exchange itself
/// (REST login and friends) lives outside this crate.
#[async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    async fn acquire(&self) -> Result<String>;
}

/// Provider for a pre-acquired session token.
#[derive(Debug)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn acquire(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Derives a deterministic challenge-signature token from a signing key.
#[derive(Debug)]
pub struct KeyTokenProvider {
    key: SigningKey,
}

impl KeyTokenProvider {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl TokenProvider for KeyTokenProvider {
    async fn acquire(&self) -> Result<String> {
        let publisher_id = self.key.publisher_id();
        let payload = format!("rill/login/{publisher_id}");
        let signature = self.key.sign(payload.as_bytes());
        Ok(format!("{publisher_id}.{}", signature.to_hex()))
    }
}

/// Builds the default provider for the supplied auth option. API-key and
/// username+password exchanges need an external login gateway; without one
/// the caller must pass a custom [`TokenProvider`].
pub(crate) fn provider_for(auth: &Auth) -> Result<Arc<dyn TokenProvider>> {
    auth.validate()?;
    if let Some(token) = &auth.session_token {
        return Ok(Arc::new(StaticTokenProvider::new(token.clone())));
    }
    if let Some(key_hex) = &auth.private_key {
        let key = SigningKey::from_hex(key_hex)
            .map_err(|err| ClientError::Configuration(format!("invalid private key: {err}")))?;
        return Ok(Arc::new(KeyTokenProvider::new(key)));
    }
    Err(ClientError::Configuration(
        "api_key and username+password auth need a login gateway; supply a custom token provider"
            .into(),
    ))
}

/// Token cache shared by every request path. The async mutex serializes
/// fetches, so concurrent requesters share one pending acquisition.
pub(crate) struct SessionTokens {
    provider: Arc<dyn TokenProvider>,
    cached: Mutex<Option<String>>,
}

impl SessionTokens {
    pub(crate) fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    pub(crate) async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.provider.acquire().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    pub(crate) async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn exactly_one_credential_is_required() {
        Auth::with_session_token("t").validate().expect("token");
        Auth::with_credentials("user", "pass")
            .validate()
            .expect("credentials");
        assert!(Auth::default().validate().is_err());
        let both = Auth {
            session_token: Some("t".into()),
            api_key: Some("k".into()),
            ..Auth::default()
        };
        assert!(both.validate().is_err());
        let half = Auth {
            username: Some("user".into()),
            ..Auth::default()
        };
        assert!(half.validate().is_err());
    }

    #[test]
    fn api_key_without_gateway_is_a_configuration_error() {
        let err = provider_for(&Auth::with_api_key("key")).expect_err("gateway");
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[derive(Debug)]
    struct CountingProvider {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn acquire(&self) -> Result<String> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            // Suspend so concurrent callers pile up on the mutex.
            tokio::task::yield_now().await;
            Ok("shared-token".into())
        }
    }

    #[tokio::test]
    async fn concurrent_requesters_share_one_fetch() {
        let provider = Arc::new(CountingProvider {
            fetches: AtomicUsize::new(0),
        });
        let tokens = Arc::new(SessionTokens::new(provider.clone()));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let tokens = Arc::clone(&tokens);
            tasks.push(tokio::spawn(async move { tokens.token().await }));
        }
        for task in tasks {
            assert_eq!(task.await.expect("join").expect("token"), "shared-token");
        }
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let provider = Arc::new(CountingProvider {
            fetches: AtomicUsize::new(0),
        });
        let tokens = SessionTokens::new(provider.clone());
        tokens.token().await.expect("first");
        tokens.token().await.expect("cached");
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
        tokens.invalidate().await;
        tokens.token().await.expect("refetch");
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn key_provider_tokens_are_deterministic() {
        let key = SigningKey::from_bytes([9u8; 32]);
        let provider = KeyTokenProvider::new(key);
        let first = provider.acquire().await.expect("token");
        let second = provider.acquire().await.expect("token");
        assert_eq!(first, second);
        assert!(first.starts_with(&key.publisher_id()));
    }
}
