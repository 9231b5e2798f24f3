// Client defaults, env overrides, and optional YAML config files.
use serde::Deserialize;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::Auth;
use crate::error::{ClientError, Result};

pub(crate) const DEFAULT_RETRY_RESEND_AFTER: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_LIVE_BUFFER_CAPACITY: usize = 1024;

/// When to verify message signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// Skip verification entirely.
    Never,
    /// Verify only messages that declare a signature.
    #[default]
    Auto,
    /// Require a valid signature on every message.
    Always,
}

impl FromStr for SignaturePolicy {
    type Err = ClientError;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "never" => Ok(SignaturePolicy::Never),
            "auto" => Ok(SignaturePolicy::Auto),
            "always" => Ok(SignaturePolicy::Always),
            other => Err(ClientError::Configuration(format!(
                "unknown signature policy: {other} (expected never|auto|always)"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub auth: Auth,
    pub verify_signatures: SignaturePolicy,
    /// `subscribe()` implicitly connects when true.
    pub auto_connect: bool,
    /// The last `unsubscribe()` triggers a disconnect when true.
    pub auto_disconnect: bool,
    /// Retry an empty last-N resend once after `retry_resend_after`.
    pub retry_resend: bool,
    /// Storage-settle delay before the empty-resend retry.
    pub retry_resend_after: Duration,
    /// Deadline for correlated request/response pairs. None disables.
    pub request_timeout: Option<Duration>,
    pub event_queue_capacity: usize,
    pub live_buffer_capacity: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    verify_signatures: Option<String>,
    auto_connect: Option<bool>,
    auto_disconnect: Option<bool>,
    retry_resend: Option<bool>,
    retry_resend_after_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    event_queue_capacity: Option<usize>,
    live_buffer_capacity: Option<usize>,
}

impl ClientConfig {
    pub fn new(auth: Auth) -> Self {
        Self {
            auth,
            verify_signatures: SignaturePolicy::default(),
            auto_connect: true,
            auto_disconnect: false,
            retry_resend: true,
            retry_resend_after: DEFAULT_RETRY_RESEND_AFTER,
            request_timeout: None,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            live_buffer_capacity: DEFAULT_LIVE_BUFFER_CAPACITY,
        }
    }

    /// Defaults, then `RILL_*` environment overrides.
    pub fn from_env(auth: Auth) -> Result<Self> {
        let mut config = Self::new(auth);
        if let Some(value) = read_str_env("RILL_VERIFY_SIGNATURES") {
            config.verify_signatures = value.parse()?;
        }
        if let Some(value) = read_bool_env("RILL_AUTO_CONNECT") {
            config.auto_connect = value;
        }
        if let Some(value) = read_bool_env("RILL_AUTO_DISCONNECT") {
            config.auto_disconnect = value;
        }
        if let Some(value) = read_bool_env("RILL_RETRY_RESEND") {
            config.retry_resend = value;
        }
        if let Some(value) = read_u64_env("RILL_RETRY_RESEND_AFTER_MS") {
            config.retry_resend_after = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("RILL_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = read_usize_env("RILL_EVENT_QUEUE_CAPACITY") {
            config.event_queue_capacity = value;
        }
        if let Some(value) = read_usize_env("RILL_LIVE_BUFFER_CAPACITY") {
            config.live_buffer_capacity = value;
        }
        Ok(config)
    }

    /// Env overrides first, then an optional YAML file on top
    /// (`config_path` argument or `RILL_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(auth: Auth, config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env(auth)?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("RILL_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path).map_err(|err| {
                ClientError::Configuration(format!("read client config {path}: {err}"))
            })?;
            let override_cfg: ClientConfigOverride = serde_yaml::from_str(&contents)
                .map_err(|err| {
                    ClientError::Configuration(format!("parse client config yaml: {err}"))
                })?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.auth.validate()?;
        if self.event_queue_capacity == 0 {
            return Err(ClientError::Configuration(
                "event_queue_capacity must be positive".into(),
            ));
        }
        if self.live_buffer_capacity == 0 {
            return Err(ClientError::Configuration(
                "live_buffer_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) -> Result<()> {
        if let Some(value) = &self.verify_signatures {
            config.verify_signatures = value.parse()?;
        }
        if let Some(value) = self.auto_connect {
            config.auto_connect = value;
        }
        if let Some(value) = self.auto_disconnect {
            config.auto_disconnect = value;
        }
        if let Some(value) = self.retry_resend {
            config.retry_resend = value;
        }
        if let Some(value) = self.retry_resend_after_ms {
            config.retry_resend_after = Duration::from_millis(value);
        }
        if let Some(value) = self.request_timeout_ms
            && value > 0
        {
            config.request_timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = self.event_queue_capacity
            && value > 0
        {
            config.event_queue_capacity = value;
        }
        if let Some(value) = self.live_buffer_capacity
            && value > 0
        {
            config.live_buffer_capacity = value;
        }
        Ok(())
    }
}

fn read_str_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
