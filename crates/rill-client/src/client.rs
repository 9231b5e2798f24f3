// Public client facade: spawns the engine and exposes the API surface.
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use rill_wire::StreamId;

use crate::auth::{provider_for, SessionTokens, TokenProvider};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::engine::{run_engine, Command, Engine};
use crate::error::{ClientError, Result};
use crate::resend::ResendOption;
use crate::subscription::{SubState, Subscription, SubscriptionKey};

const COMMAND_QUEUE_DEPTH: usize = 256;
const CLIENT_EVENT_QUEUE_DEPTH: usize = 256;

/// Connection-level happenings observable on [`Client::events`].
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Error(ClientError),
}

/// Options for one live subscription.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub stream_id: StreamId,
    pub partition: u32,
    pub resend: Option<ResendOption>,
}

impl SubscribeOptions {
    /// Subscribe to partition 0 of `stream_id`, no historical prefix.
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            partition: 0,
            resend: None,
        }
    }

    pub fn partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }

    pub fn resend(mut self, option: ResendOption) -> Self {
        self.resend = Some(option);
        self
    }
}

/// Options for a historical-only resend (no live leg).
#[derive(Clone, Debug)]
pub struct ResendOptions {
    pub stream_id: StreamId,
    pub partition: u32,
    pub option: ResendOption,
}

impl ResendOptions {
    pub fn new(stream_id: StreamId, option: ResendOption) -> Self {
        Self {
            stream_id,
            partition: 0,
            option,
        }
    }

    pub fn partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }
}

/// Snapshot of one registered subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionInfo {
    pub key: SubscriptionKey,
    pub state: SubState,
}

/// Client for the rill pub/sub protocol.
///
/// Multiplexes any number of logical subscriptions over the single
/// connection handed in at construction. All state lives on one engine
/// task; this handle is cheap to use from anywhere.
pub struct Client {
    commands: mpsc::Sender<Command>,
    client_events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl Client {
    /// Builds a client whose session tokens come from `config.auth`.
    pub fn new(
        connection: Arc<dyn Connection>,
        events: mpsc::Receiver<ConnectionEvent>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let provider = provider_for(&config.auth)?;
        Self::with_token_provider(connection, events, config, provider)
    }

    /// Builds a client with a caller-supplied token provider (API-key and
    /// credentials auth need one backed by a login gateway).
    pub fn with_token_provider(
        connection: Arc<dyn Connection>,
        events: mpsc::Receiver<ConnectionEvent>,
        config: ClientConfig,
        provider: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (client_events, _) = broadcast::channel(CLIENT_EVENT_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let engine = Engine::new(
            connection,
            config,
            SessionTokens::new(provider),
            commands_tx.clone(),
            client_events.clone(),
            cancel.clone(),
        );
        tokio::spawn(run_engine(engine, commands_rx, events));
        Ok(Self {
            commands: commands_tx,
            client_events,
            cancel,
        })
    }

    pub async fn connect(&self) -> Result<()> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Creates a subscription; the returned handle reports `Subscribed`
    /// once the broker acknowledged (joining an already-subscribed
    /// partition acknowledges immediately).
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription> {
        self.request(|reply| Command::Subscribe { options, reply })
            .await?
    }

    /// Requests stored messages only; the subscription ends with `Done`
    /// after the resend completes and is never replayed on reconnect.
    pub async fn resend(&self, options: ResendOptions) -> Result<Subscription> {
        self.request(|reply| Command::ResendOnly { options, reply })
            .await?
    }

    /// Every registered subscription on `stream_id`, across partitions.
    pub async fn subscriptions(&self, stream_id: &StreamId) -> Result<Vec<SubscriptionInfo>> {
        let stream_id = stream_id.clone();
        self.request(|reply| Command::Subscriptions { stream_id, reply })
            .await
    }

    /// Subscribe to `connected` / `disconnected` / `error` events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.client_events.subscribe()
    }

    /// Tears the engine down; every subscription token is cancelled.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| ClientError::Aborted)?;
        reply_rx.await.map_err(|_| ClientError::Aborted)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
