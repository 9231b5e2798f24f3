//! The dispatcher: one task owning every piece of mutable client state.
//!
//! # Purpose
//! Consumes typed inbound messages and client commands, drives each
//! subscription's state machine, correlates responses to pending requests,
//! and coordinates resend episodes and gap fills.
//!
//! # Design notes
//! All state mutation happens on this task; handles and timers talk to it
//! over the command channel, so logical races (two subscribes to the same
//! key, unsubscribe during a resend) interleave only at suspension points.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rill_wire::{
    ControlMessage, ErrorCode, MessageKind, MessageRef, RequestId, StreamId, StreamMessage,
};

use crate::auth::SessionTokens;
use crate::client::{ClientEvent, ResendOptions, SubscribeOptions, SubscriptionInfo};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::correlator::{
    Correlation, PendingRequest, RequestContext, RequestCorrelator, RESEND_EXPECTED,
    SUBSCRIBE_EXPECTED, UNSUBSCRIBE_EXPECTED,
};
use crate::error::{ClientError, Result};
use crate::ordering::{ChainKey, Verdict};
use crate::registry::{SubRecord, SubscriptionRegistry};
use crate::resend::{
    build_resend_request, Episode, EpisodeKind, EpisodePhase, ResendCoordinator, ResendOption,
};
use crate::subscription::{SubId, SubState, Subscription, SubscriptionEvent, SubscriptionKey};
use crate::verifier::MessageVerifier;

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        options: SubscribeOptions,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    ResendOnly {
        options: ResendOptions,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        id: SubId,
        reply: oneshot::Sender<Result<()>>,
    },
    SubscriptionDropped {
        id: SubId,
    },
    Subscriptions {
        stream_id: StreamId,
        reply: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    RetryResend {
        sub_id: SubId,
    },
    RequestTimeout {
        request_id: RequestId,
    },
}

enum Terminal {
    Resent,
    NoResend { is_retry: bool, seen: u64 },
}

pub(crate) struct Engine {
    connection: Arc<dyn Connection>,
    config: ClientConfig,
    tokens: SessionTokens,
    registry: SubscriptionRegistry,
    correlator: RequestCorrelator,
    verifier: MessageVerifier,
    resends: ResendCoordinator,
    commands_tx: mpsc::Sender<Command>,
    client_events: broadcast::Sender<ClientEvent>,
    next_request_id: u64,
    connected: bool,
    cancel: CancellationToken,
}

impl Engine {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        config: ClientConfig,
        tokens: SessionTokens,
        commands_tx: mpsc::Sender<Command>,
        client_events: broadcast::Sender<ClientEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let verifier = MessageVerifier::new(config.verify_signatures);
        Self {
            connection,
            config,
            tokens,
            registry: SubscriptionRegistry::new(),
            correlator: RequestCorrelator::new(),
            verifier,
            resends: ResendCoordinator::new(),
            commands_tx,
            client_events,
            next_request_id: 0,
            connected: false,
            cancel,
        }
    }

    /// Request ids are unique per client instance, not per process.
    fn fresh_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        RequestId::new(self.next_request_id.to_string())
    }

    async fn send(&self, message: ControlMessage) -> Result<()> {
        metrics::counter!("rill_client_requests_sent_total").increment(1);
        self.connection.send(message).await
    }

    fn client_error(&self, error: ClientError) {
        warn!(error = %error, "client error");
        metrics::counter!("rill_client_errors_total").increment(1);
        let _ = self.client_events.send(ClientEvent::Error(error));
    }

    // ---- commands ------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = if self.connected {
                    Ok(())
                } else {
                    self.connection.connect().await
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.connection.disconnect().await);
            }
            Command::Subscribe { options, reply } => {
                let result = self.subscribe(options).await;
                let _ = reply.send(result);
            }
            Command::ResendOnly { options, reply } => {
                let result = self.resend_only(options).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { id, reply } => self.unsubscribe(id, Some(reply)).await,
            Command::SubscriptionDropped { id } => self.unsubscribe(id, None).await,
            Command::Subscriptions { stream_id, reply } => {
                let _ = reply.send(self.subscription_infos(&stream_id));
            }
            Command::RetryResend { sub_id } => self.retry_resend(sub_id).await,
            Command::RequestTimeout { request_id } => self.request_timeout(request_id).await,
        }
    }

    async fn subscribe(&mut self, options: SubscribeOptions) -> Result<Subscription> {
        if let Some(option) = &options.resend {
            option.validate()?;
        }
        let key = SubscriptionKey {
            stream_id: options.stream_id,
            partition: options.partition,
        };
        let handle = self.create_subscription(key.clone(), options.resend, false);
        self.registry.entry_or_create(&key).members.push(handle.id);
        debug!(key = %key, sub_id = handle.id, "subscription created");
        if self.connected {
            self.ensure_partition_subscribed(&key).await;
        } else if self.config.auto_connect {
            self.spawn_connect();
        }
        Ok(handle)
    }

    async fn resend_only(&mut self, options: ResendOptions) -> Result<Subscription> {
        options.option.validate()?;
        let key = SubscriptionKey {
            stream_id: options.stream_id,
            partition: options.partition,
        };
        // Historical-only subscriptions never join a partition entry: they
        // receive unicasts by request id, are not replayed on reconnect,
        // and never trigger a broker subscribe.
        let handle = self.create_subscription(key, Some(options.option), true);
        debug!(key = %handle.key, sub_id = handle.id, "historical subscription created");
        if self.connected {
            self.start_initial_resend(handle.id, false).await;
        } else if self.config.auto_connect {
            self.spawn_connect();
        }
        Ok(handle)
    }

    fn create_subscription(
        &mut self,
        key: SubscriptionKey,
        resend: Option<ResendOption>,
        historical_only: bool,
    ) -> Subscription {
        let id = self.registry.allocate_id();
        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_capacity);
        let cancel = self.cancel.child_token();
        self.registry.insert(SubRecord {
            id,
            key: key.clone(),
            state: SubState::Pending,
            events: events_tx,
            cancel: cancel.clone(),
            resend,
            historical_only,
            resend_completed: false,
            pending_resend: None,
            buffer: VecDeque::new(),
            delivered: HashMap::new(),
        });
        Subscription {
            id,
            key,
            events: events_rx,
            commands: self.commands_tx.clone(),
            cancel,
        }
    }

    fn spawn_connect(&self) {
        let connection = Arc::clone(&self.connection);
        let events = self.client_events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = connection.connect() => {
                    if let Err(err) = result {
                        let _ = events.send(ClientEvent::Error(err));
                    }
                }
            }
        });
    }

    /// Sends at most one SubscribeRequest per partition per connected
    /// epoch, no matter how many members pile onto the entry.
    async fn ensure_partition_subscribed(&mut self, key: &SubscriptionKey) {
        let (already_subscribed, request_in_flight) = match self.registry.entry(key) {
            Some(entry) => (entry.broker_subscribed, entry.subscribe_request.is_some()),
            None => return,
        };
        if already_subscribed {
            self.mark_members_subscribed(key).await;
            return;
        }
        if request_in_flight {
            for id in self.registry.members(key) {
                if let Some(record) = self.registry.sub_mut(id)
                    && matches!(record.state, SubState::Pending | SubState::Unsubscribed)
                {
                    record.state = SubState::Subscribing;
                }
            }
            return;
        }
        let request_id = self.fresh_request_id();
        let token = match self.tokens.token().await {
            Ok(token) => Some(token),
            Err(err) => {
                self.fail_partition(key, err);
                return;
            }
        };
        let request = ControlMessage::SubscribeRequest {
            request_id: request_id.clone(),
            stream_id: key.stream_id.clone(),
            stream_partition: key.partition,
            session_token: token,
        };
        match self.send(request).await {
            Ok(()) => {
                debug!(key = %key, request_id = %request_id, "subscribe request sent");
                self.correlator.register(PendingRequest {
                    request_id: request_id.clone(),
                    expected: SUBSCRIBE_EXPECTED,
                    context: RequestContext::Subscribe { key: key.clone() },
                    notify: None,
                });
                self.arm_timeout(&request_id);
                if let Some(entry) = self.registry.entry_mut(key) {
                    entry.subscribe_request = Some(request_id);
                }
                for id in self.registry.members(key) {
                    if let Some(record) = self.registry.sub_mut(id)
                        && matches!(record.state, SubState::Pending | SubState::Unsubscribed)
                    {
                        record.state = SubState::Subscribing;
                    }
                }
            }
            Err(err) => self.client_error(err),
        }
    }

    async fn mark_members_subscribed(&mut self, key: &SubscriptionKey) {
        let mut need_resend = Vec::new();
        for id in self.registry.members(key) {
            let Some(record) = self.registry.sub_mut(id) else {
                continue;
            };
            if !matches!(
                record.state,
                SubState::Pending | SubState::Subscribing | SubState::Unsubscribed
            ) {
                continue;
            }
            record.state = SubState::Subscribed;
            record.emit(SubscriptionEvent::Subscribed);
            if record.resend.is_some()
                && !record.resend_completed
                && record.pending_resend.is_none()
            {
                need_resend.push(id);
            }
        }
        for id in need_resend {
            self.start_initial_resend(id, false).await;
        }
    }

    fn fail_partition(&mut self, key: &SubscriptionKey, error: ClientError) {
        let members = self.registry.members(key);
        self.registry.remove_entry(key);
        for id in members {
            if let Some(record) = self.registry.sub_mut(id) {
                record.emit(SubscriptionEvent::Error(error.clone()));
                record.state = SubState::Error;
            }
            if let Some(record) = self.registry.remove_sub(id) {
                record.cancel.cancel();
            }
        }
    }

    async fn unsubscribe(&mut self, id: SubId, reply: Option<oneshot::Sender<Result<()>>>) {
        let Some(record) = self.registry.sub(id) else {
            // Already gone; repeated unsubscribes are no-ops.
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        };
        if matches!(record.state, SubState::Unsubscribing) {
            // One UnsubscribeRequest is already out; collapse.
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        let key = record.key.clone();
        let historical = record.historical_only;
        for request_id in self.resends.remove_for_sub(id) {
            self.correlator.remove(&request_id);
        }
        if historical {
            self.finish_record(id, true);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            self.check_auto_disconnect().await;
            return;
        }
        let remaining_live = self
            .registry
            .members(&key)
            .iter()
            .filter(|member| **member != id)
            .count();
        if remaining_live > 0 {
            // Other members keep the wire subscription alive.
            self.registry.remove_member(&key, id);
            self.finish_record(id, true);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        let needs_wire_unsubscribe = self
            .registry
            .entry(&key)
            .map(|entry| entry.broker_subscribed || entry.subscribe_request.is_some())
            .unwrap_or(false);
        if self.connected && needs_wire_unsubscribe {
            let request_id = self.fresh_request_id();
            let request = ControlMessage::UnsubscribeRequest {
                request_id: request_id.clone(),
                stream_id: key.stream_id.clone(),
                stream_partition: key.partition,
            };
            match self.send(request).await {
                Ok(()) => {
                    debug!(key = %key, request_id = %request_id, "unsubscribe request sent");
                    self.correlator.register(PendingRequest {
                        request_id: request_id.clone(),
                        expected: UNSUBSCRIBE_EXPECTED,
                        context: RequestContext::Unsubscribe { key: key.clone() },
                        notify: reply,
                    });
                    self.arm_timeout(&request_id);
                    if let Some(entry) = self.registry.entry_mut(&key) {
                        entry.unsubscribe_request = Some(request_id);
                    }
                    if let Some(record) = self.registry.sub_mut(id) {
                        record.state = SubState::Unsubscribing;
                    }
                }
                Err(err) => {
                    self.client_error(err);
                    self.registry.remove_entry(&key);
                    self.finish_record(id, true);
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        } else {
            self.registry.remove_entry(&key);
            self.finish_record(id, true);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            self.check_auto_disconnect().await;
        }
    }

    /// Removes the record for good, optionally emitting the one
    /// `Unsubscribed` this subscription gets.
    fn finish_record(&mut self, id: SubId, emit_unsubscribed: bool) {
        if let Some(record) = self.registry.remove_sub(id) {
            if emit_unsubscribed {
                record.emit(SubscriptionEvent::Unsubscribed);
            }
            record.cancel.cancel();
        }
    }

    fn subscription_infos(&self, stream_id: &StreamId) -> Vec<SubscriptionInfo> {
        self.registry
            .subs_on_stream(stream_id)
            .into_iter()
            .filter_map(|id| self.registry.sub(id))
            .map(|record| SubscriptionInfo {
                key: record.key.clone(),
                state: record.state,
            })
            .collect()
    }

    async fn check_auto_disconnect(&mut self) {
        if self.config.auto_disconnect && self.connected && self.registry.is_empty() {
            debug!("last subscription gone; auto-disconnecting");
            if let Err(err) = self.connection.disconnect().await {
                self.client_error(err);
            }
        }
    }

    // ---- resend episodes -----------------------------------------------

    async fn start_initial_resend(&mut self, sub_id: SubId, is_retry: bool) {
        let Some(record) = self.registry.sub(sub_id) else {
            return;
        };
        if record.cancel.is_cancelled() {
            return;
        }
        let Some(option) = record.resend.clone() else {
            return;
        };
        let key = record.key.clone();
        let historical = record.historical_only;
        let request_id = self.fresh_request_id();
        let token = match self.tokens.token().await {
            Ok(token) => Some(token),
            Err(err) => {
                if historical {
                    self.fail_historical(sub_id, err);
                } else if let Some(record) = self.registry.sub_mut(sub_id) {
                    record.emit(SubscriptionEvent::Error(err));
                }
                return;
            }
        };
        let request = build_resend_request(&option, &key, request_id.clone(), token);
        match self.send(request).await {
            Ok(()) => {
                debug!(key = %key, request_id = %request_id, is_retry, "resend request sent");
                self.resends.register(
                    request_id.clone(),
                    Episode {
                        kind: EpisodeKind::Initial { sub_id },
                        phase: EpisodePhase::AwaitingAck,
                        option,
                        seen: 0,
                        is_retry,
                    },
                );
                self.correlator.register(PendingRequest {
                    request_id: request_id.clone(),
                    expected: RESEND_EXPECTED,
                    context: RequestContext::Resend { sub_id },
                    notify: None,
                });
                self.arm_timeout(&request_id);
                if let Some(record) = self.registry.sub_mut(sub_id) {
                    record.pending_resend = Some(request_id);
                }
            }
            Err(err) => {
                if historical {
                    self.fail_historical(sub_id, err);
                } else if let Some(record) = self.registry.sub_mut(sub_id) {
                    record.emit(SubscriptionEvent::Error(err));
                }
            }
        }
    }

    /// Historical-only subscription hit a terminal error: no live leg to
    /// fall back to.
    fn fail_historical(&mut self, sub_id: SubId, error: ClientError) {
        if let Some(record) = self.registry.sub_mut(sub_id) {
            record.emit(SubscriptionEvent::Error(error));
            record.state = SubState::Error;
        }
        if let Some(record) = self.registry.remove_sub(sub_id) {
            record.cancel.cancel();
        }
    }

    async fn retry_resend(&mut self, sub_id: SubId) {
        if !self.connected {
            return;
        }
        let Some(record) = self.registry.sub(sub_id) else {
            return;
        };
        if record.cancel.is_cancelled()
            || record.pending_resend.is_some()
            || record.resend_completed
            || matches!(
                record.state,
                SubState::Unsubscribing | SubState::Unsubscribed | SubState::Error
            )
        {
            return;
        }
        metrics::counter!("rill_client_resend_retries_total").increment(1);
        debug!(sub_id, "retrying empty resend after storage settle");
        self.start_initial_resend(sub_id, true).await;
    }

    fn schedule_retry(&self, sub_id: SubId) {
        let Some(record) = self.registry.sub(sub_id) else {
            return;
        };
        let delay = self.config.retry_resend_after;
        let commands = self.commands_tx.clone();
        let cancel = record.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::RetryResend { sub_id }).await;
                }
            }
        });
    }

    fn arm_timeout(&self, request_id: &RequestId) {
        let Some(timeout) = self.config.request_timeout else {
            return;
        };
        let request_id = request_id.clone();
        let commands = self.commands_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = commands.send(Command::RequestTimeout { request_id }).await;
                }
            }
        });
    }

    async fn request_timeout(&mut self, request_id: RequestId) {
        let Some(pending) = self.correlator.remove(&request_id) else {
            return;
        };
        debug!(request_id = %request_id, "request timed out");
        self.handle_rejected(pending, ClientError::Timeout).await;
    }

    // ---- inbound -------------------------------------------------------

    async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected().await,
            ConnectionEvent::Disconnected => self.on_disconnected(),
            ConnectionEvent::Message(message) => self.route_message(message).await,
            ConnectionEvent::DecodeError { stream_id, error } => {
                let error = ClientError::Decode(error);
                if let Some(stream_id) = &stream_id {
                    for id in self.registry.subs_on_stream(stream_id) {
                        if let Some(record) = self.registry.sub(id) {
                            record.emit(SubscriptionEvent::Error(error.clone()));
                        }
                    }
                }
                self.client_error(error);
            }
        }
    }

    async fn on_connected(&mut self) {
        debug!("connected");
        self.connected = true;
        let _ = self.client_events.send(ClientEvent::Connected);
        // One SubscribeRequest per live partition entry, never per member.
        for key in self.registry.replay_keys() {
            self.ensure_partition_subscribed(&key).await;
        }
        for sub_id in self.registry.pending_historical() {
            self.start_initial_resend(sub_id, false).await;
        }
    }

    fn on_disconnected(&mut self) {
        debug!("disconnected");
        self.connected = false;
        let _ = self.client_events.send(ClientEvent::Disconnected);
        for mut pending in self.correlator.fail_all() {
            pending.notify(Err(ClientError::Disconnected));
            if let RequestContext::Unsubscribe { key } = &pending.context {
                // The broker side is gone either way; finish locally.
                let members = self.registry.members(key);
                self.registry.remove_entry(key);
                for id in members {
                    self.finish_record(id, true);
                }
            }
        }
        let mut failed_historical = Vec::new();
        for (_, episode) in self.resends.drain() {
            if let EpisodeKind::Initial { sub_id } = episode.kind {
                if let Some(record) = self.registry.sub_mut(sub_id) {
                    record.emit(SubscriptionEvent::Error(ClientError::Disconnected));
                    if record.historical_only {
                        failed_historical.push(sub_id);
                    }
                }
            }
        }
        for sub_id in failed_historical {
            self.fail_historical(sub_id, ClientError::Disconnected);
        }
        // Live records become Unsubscribed (pending-resubscribe) without a
        // user-visible unsubscribed event; the client-wide `disconnected`
        // covers the outage, and a later replay re-emits `subscribed`.
        self.registry.on_disconnect();
    }

    async fn route_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::BroadcastMessage { stream_message } => {
                self.handle_broadcast(stream_message).await;
            }
            ControlMessage::UnicastMessage {
                request_id,
                stream_message,
            } => {
                self.handle_unicast(request_id, stream_message).await;
            }
            ControlMessage::ResendResponseResent { request_id, .. } => {
                self.handle_resent(request_id).await;
            }
            other => match self.correlator.on_inbound(other) {
                Correlation::Resolved { pending, response } => {
                    self.handle_resolved(pending, response).await;
                }
                Correlation::Rejected { pending, error } => {
                    self.handle_rejected(pending, error).await;
                }
                Correlation::Unclaimed(message) => self.handle_unclaimed(message).await,
            },
        }
    }

    async fn handle_resolved(&mut self, mut pending: PendingRequest, response: ControlMessage) {
        match pending.context {
            RequestContext::Subscribe { ref key } => {
                debug!(key = %key, "subscribe acknowledged");
                let key = key.clone();
                if let Some(entry) = self.registry.entry_mut(&key) {
                    entry.subscribe_request = None;
                    entry.broker_subscribed = true;
                }
                self.mark_members_subscribed(&key).await;
            }
            RequestContext::Unsubscribe { ref key } => {
                debug!(key = %key, "unsubscribe acknowledged");
                let key = key.clone();
                let members = self.registry.members(&key);
                self.registry.remove_entry(&key);
                for id in members {
                    self.finish_record(id, true);
                }
                pending.notify(Ok(()));
                self.check_auto_disconnect().await;
            }
            RequestContext::Resend { sub_id } => match response.kind() {
                MessageKind::ResendResponseResending => {
                    let is_retry = self
                        .resends
                        .get_mut(&pending.request_id)
                        .map(|episode| {
                            episode.phase = EpisodePhase::Streaming;
                            episode.is_retry
                        })
                        .unwrap_or(true);
                    if let Some(record) = self.registry.sub_mut(sub_id) {
                        record.state = SubState::Resending;
                        if !is_retry {
                            record.emit(SubscriptionEvent::Resending);
                        }
                    }
                }
                MessageKind::ResendResponseNoResend => {
                    if let Some(episode) = self.resends.remove(&pending.request_id) {
                        let terminal = Terminal::NoResend {
                            is_retry: episode.is_retry,
                            seen: episode.seen,
                        };
                        self.finish_initial_episode(sub_id, &episode.option, terminal)
                            .await;
                    }
                }
                _ => {}
            },
            RequestContext::GapFill {
                ref key, ref chain, ..
            } => match response.kind() {
                MessageKind::ResendResponseResending => {
                    if let Some(episode) = self.resends.get_mut(&pending.request_id) {
                        episode.phase = EpisodePhase::Streaming;
                    }
                }
                MessageKind::ResendResponseNoResend => {
                    let (key, chain) = (key.clone(), chain.clone());
                    self.resends.remove(&pending.request_id);
                    self.gap_fill_completed(&key, &chain).await;
                }
                _ => {}
            },
        }
    }

    async fn handle_rejected(&mut self, mut pending: PendingRequest, error: ClientError) {
        self.resends.remove(&pending.request_id);
        if let ClientError::RequestFailed {
            code: ErrorCode::PermissionDenied,
            ..
        } = &error
        {
            // The cached token was refused; the next request fetches fresh.
            self.tokens.invalidate().await;
        }
        match pending.context {
            RequestContext::Subscribe { ref key } => {
                // A failed initial subscribe is terminal for its members.
                let key = key.clone();
                if let Some(entry) = self.registry.entry_mut(&key) {
                    entry.subscribe_request = None;
                }
                self.fail_partition(&key, error);
            }
            RequestContext::Unsubscribe { ref key } => {
                let key = key.clone();
                let members = self.registry.members(&key);
                self.registry.remove_entry(&key);
                for id in members {
                    if let Some(record) = self.registry.sub(id) {
                        record.emit(SubscriptionEvent::Error(error.clone()));
                    }
                    self.finish_record(id, true);
                }
                pending.notify(Err(error));
                self.check_auto_disconnect().await;
            }
            RequestContext::Resend { sub_id } => {
                // A failed resend is not fatal for a live subscription.
                let historical = self
                    .registry
                    .sub(sub_id)
                    .map(|record| record.historical_only)
                    .unwrap_or(false);
                if historical {
                    self.fail_historical(sub_id, error);
                    return;
                }
                if let Some(record) = self.registry.sub_mut(sub_id) {
                    record.emit(SubscriptionEvent::Error(error));
                    record.pending_resend = None;
                    record.resend_completed = true;
                }
                self.flush_buffer(sub_id).await;
                if let Some(record) = self.registry.sub_mut(sub_id)
                    && record.state == SubState::Resending
                {
                    record.state = SubState::Subscribed;
                }
            }
            RequestContext::GapFill {
                ref key, ref chain, ..
            } => {
                let (key, chain) = (key.clone(), chain.clone());
                self.client_error(error);
                // Drop any coalesced coverage rather than re-requesting a
                // range the broker just refused.
                if let Some(tracker) = self.registry.tracker_mut(&key, &chain) {
                    tracker.reset_fill();
                }
            }
        }
    }

    async fn handle_unclaimed(&mut self, message: ControlMessage) {
        if let ControlMessage::ErrorResponse {
            request_id,
            error_code,
            error_message,
        } = &message
        {
            let error = ClientError::RequestFailed {
                code: *error_code,
                message: error_message.clone(),
            };
            // A streaming episode can still be terminated by an error after
            // its ack consumed the correlator waiter.
            if let Some(request_id) = request_id
                && self.resends.contains(request_id)
            {
                let request_id = request_id.clone();
                if let Some(episode) = self.resends.remove(&request_id) {
                    match episode.kind {
                        EpisodeKind::Initial { sub_id } => {
                            let pending = PendingRequest {
                                request_id,
                                expected: RESEND_EXPECTED,
                                context: RequestContext::Resend { sub_id },
                                notify: None,
                            };
                            self.handle_rejected(pending, error).await;
                        }
                        EpisodeKind::GapFill { key, chain } => {
                            self.client_error(error);
                            if let Some(tracker) = self.registry.tracker_mut(&key, &chain) {
                                tracker.reset_fill();
                            }
                        }
                    }
                }
                return;
            }
            self.client_error(ClientError::Protocol(format!(
                "unmatched error response ({error_code}): {error_message}"
            )));
            return;
        }
        if let Some(request_id) = message.request_id()
            && self.resends.contains(request_id)
        {
            // Duplicate ack for an episode already past that phase.
            debug!(request_id = %request_id, kind = ?message.kind(), "stale episode response ignored");
            return;
        }
        self.client_error(ClientError::Protocol(format!(
            "unexpected {:?} with no pending request",
            message.kind()
        )));
    }

    async fn handle_resent(&mut self, request_id: RequestId) {
        let Some(episode) = self.resends.remove(&request_id) else {
            self.client_error(ClientError::Protocol(format!(
                "unexpected ResendResponseResent for request {request_id}"
            )));
            return;
        };
        // The paired correlator waiter is gone once the ack arrived, but a
        // NoResend-less broker may skip straight to Resent.
        self.correlator.remove(&request_id);
        match episode.kind {
            EpisodeKind::Initial { sub_id } => {
                self.finish_initial_episode(sub_id, &episode.option, Terminal::Resent)
                    .await;
            }
            EpisodeKind::GapFill { key, chain } => {
                self.gap_fill_completed(&key, &chain).await;
            }
        }
    }

    async fn finish_initial_episode(
        &mut self,
        sub_id: SubId,
        option: &ResendOption,
        terminal: Terminal,
    ) {
        let Some(record) = self.registry.sub_mut(sub_id) else {
            return;
        };
        record.pending_resend = None;
        let historical = record.historical_only;
        let mut retry_scheduled = false;
        match terminal {
            Terminal::Resent => {
                record.resend_completed = true;
                record.emit(SubscriptionEvent::Resent);
            }
            Terminal::NoResend { is_retry, seen } => {
                // The user-visible event fires on the first terminal only;
                // the storage-settle retry is internal and silent.
                if !is_retry {
                    record.emit(SubscriptionEvent::NoResend);
                }
                let retry_wanted = !is_retry
                    && seen == 0
                    && self.config.retry_resend
                    && matches!(option, ResendOption::Last { .. })
                    && self.connected;
                if retry_wanted {
                    retry_scheduled = true;
                } else {
                    record.resend_completed = true;
                }
            }
        }
        self.flush_buffer(sub_id).await;
        if retry_scheduled {
            self.schedule_retry(sub_id);
        }
        if historical {
            if !retry_scheduled {
                if let Some(record) = self.registry.sub_mut(sub_id) {
                    record.state = SubState::ResendDone;
                    record.emit(SubscriptionEvent::Done);
                }
                if let Some(record) = self.registry.remove_sub(sub_id) {
                    record.cancel.cancel();
                }
            }
        } else if let Some(record) = self.registry.sub_mut(sub_id) {
            record.state = SubState::Subscribed;
        }
    }

    /// Flushes live messages buffered during a resend episode, deduped
    /// against what the episode delivered, filling any seam between the
    /// resent tail and the live edge.
    async fn flush_buffer(&mut self, sub_id: SubId) {
        let Some(record) = self.registry.sub_mut(sub_id) else {
            return;
        };
        if record.buffer.is_empty() {
            record.delivered.clear();
            return;
        }
        let key = record.key.clone();
        let buffered: Vec<StreamMessage> = record.buffer.drain(..).collect();
        let mut delivered = std::mem::take(&mut record.delivered);
        let mut events = Vec::new();
        let mut fills = Vec::new();
        for message in buffered {
            let chain = ChainKey::of(&message.message_id);
            let mut gap = None;
            if let Some(last) = delivered.get(&chain).copied() {
                if message.msg_ref() <= last {
                    // The resend already covered this one.
                    metrics::counter!("rill_client_duplicates_dropped_total").increment(1);
                    continue;
                }
                if let Some(prev) = message.prev_msg_ref
                    && prev > last
                {
                    gap = Some((last.successor(), prev));
                    fills.push((chain.clone(), last.successor(), prev));
                }
            }
            delivered.insert(chain.clone(), message.msg_ref());
            events.push(SubscriptionEvent::Message(message));
            // Delivery first, then the gap it revealed, like the live path.
            if let Some((from, to)) = gap {
                events.push(SubscriptionEvent::Gap {
                    from,
                    to,
                    publisher_id: chain.publisher_id.clone(),
                    msg_chain_id: chain.msg_chain_id.clone(),
                });
            }
        }
        if let Some(record) = self.registry.sub_mut(sub_id) {
            for event in events {
                record.emit(event);
            }
        }
        for (chain, from, to) in fills {
            self.issue_gap_fill(&key, &chain, from, to).await;
        }
    }

    // ---- data path -----------------------------------------------------

    async fn handle_broadcast(&mut self, stream_message: StreamMessage) {
        let key = SubscriptionKey {
            stream_id: stream_message.message_id.stream_id.clone(),
            partition: stream_message.message_id.stream_partition,
        };
        if self.registry.entry(&key).is_none() {
            debug!(key = %key, "broadcast for unknown partition; dropping");
            return;
        }
        // One verification handle per delivery; every member shares it.
        let handle = self.verifier.handle(&stream_message);
        if !handle.result(&stream_message, self.verifier.policy()) {
            self.client_error(ClientError::Protocol(format!(
                "signature verification failed for message from {}",
                stream_message.message_id.publisher_id
            )));
            return;
        }
        let Some((verdict, members)) = self.registry.observe(&key, &stream_message) else {
            return;
        };
        match verdict {
            Verdict::Drop => {
                metrics::counter!("rill_client_duplicates_dropped_total").increment(1);
            }
            Verdict::Deliver => self.fanout(&members, &stream_message),
            Verdict::DeliverWithGap { from, to } => {
                let chain = ChainKey::of(&stream_message.message_id);
                self.fanout(&members, &stream_message);
                for id in &members {
                    if let Some(record) = self.registry.sub(*id) {
                        record.emit(SubscriptionEvent::Gap {
                            from,
                            to,
                            publisher_id: chain.publisher_id.clone(),
                            msg_chain_id: chain.msg_chain_id.clone(),
                        });
                    }
                }
                metrics::counter!("rill_client_gaps_detected_total").increment(1);
                // observe() already marked this chain's fill in flight.
                self.send_gap_fill(&key, &chain, from, to).await;
            }
        }
    }

    fn fanout(&mut self, members: &[SubId], message: &StreamMessage) {
        for id in members {
            let Some(record) = self.registry.sub_mut(*id) else {
                continue;
            };
            if record.buffering() {
                if record.buffer.len() >= self.config.live_buffer_capacity {
                    warn!(key = %record.key, "live buffer full during resend; dropping message");
                    metrics::counter!("rill_client_buffer_dropped_total").increment(1);
                    continue;
                }
                record.buffer.push_back(message.clone());
                continue;
            }
            if record.state == SubState::Subscribed {
                record.emit(SubscriptionEvent::Message(message.clone()));
                metrics::counter!("rill_client_messages_delivered_total").increment(1);
            }
        }
    }

    async fn handle_unicast(&mut self, request_id: RequestId, stream_message: StreamMessage) {
        let Some(episode) = self.resends.get_mut(&request_id) else {
            self.client_error(ClientError::Protocol(format!(
                "Received unexpected UnicastMessage with requestId {request_id}"
            )));
            return;
        };
        episode.seen += 1;
        let kind = episode.kind.clone();
        let handle = self.verifier.handle(&stream_message);
        if !handle.result(&stream_message, self.verifier.policy()) {
            self.client_error(ClientError::Protocol(format!(
                "signature verification failed for message from {}",
                stream_message.message_id.publisher_id
            )));
            return;
        }
        match kind {
            EpisodeKind::Initial { sub_id } => self.deliver_resent(sub_id, stream_message).await,
            EpisodeKind::GapFill { key, chain } => {
                self.deliver_fill(&key, &chain, stream_message);
            }
        }
    }

    async fn deliver_resent(&mut self, sub_id: SubId, message: StreamMessage) {
        let chain = ChainKey::of(&message.message_id);
        let Some(record) = self.registry.sub_mut(sub_id) else {
            return;
        };
        let key = record.key.clone();
        let mut gap = None;
        if let Some(last) = record.delivered.get(&chain).copied() {
            if message.msg_ref() <= last {
                metrics::counter!("rill_client_duplicates_dropped_total").increment(1);
                return;
            }
            if let Some(prev) = message.prev_msg_ref
                && prev > last
            {
                gap = Some((last.successor(), prev));
            }
        }
        record.delivered.insert(chain.clone(), message.msg_ref());
        if let Some((from, to)) = gap {
            record.emit(SubscriptionEvent::Gap {
                from,
                to,
                publisher_id: chain.publisher_id.clone(),
                msg_chain_id: chain.msg_chain_id.clone(),
            });
        }
        record.emit(SubscriptionEvent::Message(message));
        metrics::counter!("rill_client_messages_delivered_total").increment(1);
        if let Some((from, to)) = gap {
            self.issue_gap_fill(&key, &chain, from, to).await;
        }
    }

    /// Gap-fill unicasts repair refs below the live edge: deliver without
    /// touching the chain tracker so no nested gap requests can start.
    fn deliver_fill(&mut self, key: &SubscriptionKey, _chain: &ChainKey, message: StreamMessage) {
        for id in self.registry.members(key) {
            let Some(record) = self.registry.sub_mut(id) else {
                continue;
            };
            if record.buffering() {
                if record.buffer.len() < self.config.live_buffer_capacity {
                    record.buffer.push_back(message.clone());
                }
                continue;
            }
            if record.state == SubState::Subscribed {
                record.emit(SubscriptionEvent::Message(message.clone()));
                metrics::counter!("rill_client_messages_delivered_total").increment(1);
            }
        }
    }

    async fn issue_gap_fill(
        &mut self,
        key: &SubscriptionKey,
        chain: &ChainKey,
        from: MessageRef,
        to: MessageRef,
    ) {
        // The tracker enforces one outstanding fill per chain; later gaps
        // extend a pending range instead.
        if let Some((from, to)) = self.registry.request_fill(key, chain, from, to) {
            self.send_gap_fill(key, chain, from, to).await;
        }
    }

    async fn send_gap_fill(
        &mut self,
        key: &SubscriptionKey,
        chain: &ChainKey,
        from: MessageRef,
        to: MessageRef,
    ) {
        let request_id = self.fresh_request_id();
        let token = match self.tokens.token().await {
            Ok(token) => Some(token),
            Err(err) => {
                self.client_error(err);
                if let Some(tracker) = self.registry.tracker_mut(key, chain) {
                    tracker.reset_fill();
                }
                return;
            }
        };
        let option = ResendOption::Range {
            from,
            to,
            publisher_id: Some(chain.publisher_id.clone()),
            msg_chain_id: Some(chain.msg_chain_id.clone()),
        };
        let request = build_resend_request(&option, key, request_id.clone(), token);
        match self.send(request).await {
            Ok(()) => {
                debug!(key = %key, request_id = %request_id, %from, %to, "gap fill requested");
                metrics::counter!("rill_client_gap_fills_total").increment(1);
                self.resends.register(
                    request_id.clone(),
                    Episode {
                        kind: EpisodeKind::GapFill {
                            key: key.clone(),
                            chain: chain.clone(),
                        },
                        phase: EpisodePhase::AwaitingAck,
                        option,
                        seen: 0,
                        is_retry: false,
                    },
                );
                self.correlator.register(PendingRequest {
                    request_id: request_id.clone(),
                    expected: RESEND_EXPECTED,
                    context: RequestContext::GapFill {
                        key: key.clone(),
                        chain: chain.clone(),
                    },
                    notify: None,
                });
                self.arm_timeout(&request_id);
            }
            Err(err) => {
                self.client_error(err);
                if let Some(tracker) = self.registry.tracker_mut(key, chain) {
                    tracker.reset_fill();
                }
            }
        }
    }

    async fn gap_fill_completed(&mut self, key: &SubscriptionKey, chain: &ChainKey) {
        let extended = self
            .registry
            .tracker_mut(key, chain)
            .and_then(|tracker| tracker.fill_completed());
        if let Some((from, to)) = extended {
            // Re-issue once with the coalesced coverage.
            self.send_gap_fill(key, chain, from, to).await;
        }
    }

    fn shutdown(&mut self) {
        for mut pending in self.correlator.fail_all() {
            pending.notify(Err(ClientError::Aborted));
        }
        self.cancel.cancel();
    }
}

pub(crate) async fn run_engine(
    mut engine: Engine,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<ConnectionEvent>,
) {
    debug!("engine started");
    let cancel = engine.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => {
                match command {
                    Some(command) => engine.handle_command(command).await,
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => engine.handle_event(event).await,
                    None => {
                        // Transport gone for good.
                        engine.on_disconnected();
                        break;
                    }
                }
            }
        }
    }
    engine.shutdown();
    debug!("engine exited");
}
