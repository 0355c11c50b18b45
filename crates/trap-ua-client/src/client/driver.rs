// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection driver.
//!
//! The driver task is the only writer of the channel, the session, the
//! subscription bindings and the connection state after `connect()` has
//! claimed the client. Everything that can change them arrives here as a
//! message: channel losses from the [`SecureChannelManager`], publish
//! responses, commands from the [`UaClient`](super::UaClient) handle and the
//! housekeeping tick. Losses are therefore coalesced by construction: a loss
//! reported while a reconnection is already running belongs to a stale
//! channel epoch and is dropped.
//!
//! ```text
//!   UaClient ──commands──►┌──────────┐◄──ChannelLost── SecureChannelManager
//!                         │  Driver  │◄──PublishEvent── PublishLoop
//!   EventStream ◄─events──└──────────┘◄──tick
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ClientEvent, ClientStats, EventHub};
use super::publish::{PublishEvent, PublishLoop};
use super::state::{ConnectionState, StateCell};
use crate::backoff::{BackoffCanceller, BackoffScheduler, BackoffStep};
use crate::channel::{Channel, ChannelLost, SecureChannelManager};
use crate::config::ClientConfig;
use crate::error::{ErrorKind, UaError, UaResult};
use crate::recovery::{RecoveryContext, RecoveryOutcome, RecoveryReport, SubscriptionRecoveryManager};
use crate::session::{SessionManager, SessionRecovery};
use crate::subscription::{Delivery, MonitoredItem, SubscriptionHandle, SubscriptionRegistry, SubscriptionState};
use crate::transport::{NotificationMessage, UaTransport};
use crate::types::{EndpointUrl, NodeId};

const MIN_TICK: Duration = Duration::from_millis(10);
const MAX_TICK: Duration = Duration::from_secs(1);

// =============================================================================
// Shared state
// =============================================================================

/// State visible to both the handle and the driver.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) state: StateCell,
    pub(crate) events: EventHub,
    pub(crate) stats: ClientStats,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) session_id: RwLock<Option<NodeId>>,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            events: EventHub::default(),
            stats: ClientStats::default(),
            registry: SubscriptionRegistry::new(),
            session_id: RwLock::new(None),
        }
    }

    fn emit(&self, event: ClientEvent) {
        self.stats.record(&event);
        self.events.emit(event);
    }
}

/// Requests from the handle.
#[derive(Debug)]
pub(crate) enum Command {
    /// Create a locally registered subscription on the server.
    SyncSubscription {
        handle: SubscriptionHandle,
        reply: oneshot::Sender<UaResult<RecoveryOutcome>>,
    },
    /// Create newly added items. Replies with the number rejected.
    SyncItems {
        handle: SubscriptionHandle,
        items: Vec<MonitoredItem>,
        reply: oneshot::Sender<UaResult<usize>>,
    },
    /// Delete a server subscription.
    Delete {
        server_id: u32,
        reply: oneshot::Sender<()>,
    },
}

enum Wake {
    Cancelled,
    Lost(ChannelLost),
    Command(Option<Command>),
    Publish(PublishEvent),
    Tick,
}

// =============================================================================
// Driver
// =============================================================================

pub(crate) struct Driver {
    shared: Arc<Shared>,
    endpoint: EndpointUrl,
    channels: SecureChannelManager,
    losses: mpsc::UnboundedReceiver<ChannelLost>,
    sessions: SessionManager,
    recovery: SubscriptionRecoveryManager,
    backoff: BackoffScheduler,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    publish: Option<PublishLoop>,
    publish_tx: mpsc::UnboundedSender<PublishEvent>,
    publish_rx: mpsc::UnboundedReceiver<PublishEvent>,
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        endpoint: EndpointUrl,
        transport: Arc<dyn UaTransport>,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> (Self, BackoffCanceller) {
        let config = &shared.config;
        let (channels, losses) = SecureChannelManager::new(config, transport);
        let sessions = SessionManager::new(config);
        let recovery = SubscriptionRecoveryManager::new(config);
        let backoff = BackoffScheduler::new(config.connection_strategy.clone());
        let canceller = backoff.canceller();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();

        let driver = Self {
            shared,
            endpoint,
            channels,
            losses,
            sessions,
            recovery,
            backoff,
            commands,
            cancel,
            publish: None,
            publish_tx,
            publish_rx,
        };
        (driver, canceller)
    }

    /// Runs one connection lifetime: connect, serve, tear down.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<UaResult<()>>) {
        info!(endpoint = %self.endpoint, "Connecting");

        if let Err(error) = self.establish(false).await {
            let _ = ready.send(Err(error.clone()));
            let terminal = (error.kind() != ErrorKind::UserCancelled).then_some(error);
            self.shutdown(terminal).await;
            return;
        }

        self.shared.state.set(ConnectionState::Connected);
        info!(endpoint = %self.endpoint, "Connected");
        let _ = ready.send(Ok(()));
        self.ensure_publishing();

        let terminal = self.serve().await;
        self.shutdown(terminal).await;
    }

    // =========================================================================
    // Connection cycle
    // =========================================================================

    /// Attempts to (re)connect until success, exhaustion or cancellation.
    ///
    /// The first attempt runs immediately; every retry is preceded by a
    /// `backoff` event and its delay.
    async fn establish(&mut self, reconnecting: bool) -> UaResult<()> {
        let cancel = self.cancel.clone();
        let shared = Arc::clone(&self.shared);
        let mut reestablished = false;
        let mut retry = 0;
        self.backoff.reset();

        loop {
            shared.stats.record_attempt();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UaError::cancelled()),
                result = self.attempt(reconnecting, &mut reestablished) => result,
            };

            let error = match result {
                Ok(()) if cancel.is_cancelled() => return Err(UaError::cancelled()),
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            error.log("connection attempt");
            if !error.is_retryable() {
                return Err(error);
            }

            let emitter = Arc::clone(&shared);
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => BackoffStep::Cancelled,
                step = self.backoff.next_backoff(move |attempt, delay| {
                    emitter.emit(ClientEvent::Backoff { attempt, delay });
                }) => step,
            };

            match step {
                BackoffStep::Retry { attempt, delay } => {
                    debug!(attempt, delay = ?delay, endpoint = %self.endpoint, "Retrying connection");
                    retry = attempt;
                }
                BackoffStep::Cancelled => return Err(UaError::cancelled()),
                BackoffStep::Exhausted => {
                    warn!(attempts = retry + 1, error = %error, "Connection retries exhausted");
                    return Err(UaError::retries_exhausted(retry + 1, error));
                }
            }
        }
    }

    /// One attempt: channel, session, then subscriptions.
    async fn attempt(&mut self, reconnecting: bool, reestablished: &mut bool) -> UaResult<()> {
        let timeout = self.shared.config.connect_timeout;
        let channel = self.channels.open(&self.endpoint, timeout).await?;

        let session_recovery = if reconnecting {
            self.sessions.recover(&channel).await?
        } else {
            self.sessions.create_and_activate(&channel).await?;
            SessionRecovery::Recreated { previous: None }
        };

        let session_id = self.sessions.session().map(|s| s.session_id.clone());
        *self.shared.session_id.write() = session_id.clone();

        if let (SessionRecovery::Recreated { previous: Some(previous) }, Some(session_id)) =
            (&session_recovery, session_id)
        {
            info!(previous = %previous, session_id = %session_id, "Session recreated");
            self.shared.emit(ClientEvent::SessionRecreated {
                previous: Some(previous.clone()),
                session_id,
            });
        }

        if reconnecting && !*reestablished {
            *reestablished = true;
            self.shared.emit(ClientEvent::ConnectionReestablished);
        }

        let cx = RecoveryContext {
            channel: &channel,
            session: &self.sessions,
            registry: &self.shared.registry,
        };
        let report = self.recovery.recover(cx, &session_recovery).await?;
        if !report.outcomes.is_empty() {
            info!(
                resumed = report.resumed(),
                recreated = report.recreated(),
                failed = report.failed(),
                "Subscriptions recovered"
            );
        }
        self.announce(report);
        Ok(())
    }

    /// Handles the loss of the live channel.
    ///
    /// Returns the terminal error, if the episode ended the connection.
    async fn reconnect(&mut self, lost: ChannelLost) -> Result<(), Option<UaError>> {
        let lost_at = Instant::now();
        warn!(channel_id = lost.channel_id, reason = %lost.reason, "Connection lost, reconnecting");

        self.publish = None;
        self.shared.state.set(ConnectionState::Reconnecting);
        self.shared.emit(ClientEvent::StartReconnection);

        match self.establish(true).await {
            Ok(()) => {
                self.shared.state.set(ConnectionState::Connected);
                info!(outage = ?lost_at.elapsed(), "Reconnected");
                self.shared.emit(ClientEvent::AfterReconnection);
                self.ensure_publishing();
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::UserCancelled => Err(None),
            Err(error) => Err(Some(error)),
        }
    }

    // =========================================================================
    // Steady state
    // =========================================================================

    /// Serves the connection until it ends. Returns the terminal error.
    async fn serve(&mut self) -> Option<UaError> {
        let cancel = self.cancel.clone();
        let mut tick = self.ticker();

        loop {
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                Some(lost) = self.losses.recv() => Wake::Lost(lost),
                command = self.commands.recv() => Wake::Command(command),
                Some(event) = self.publish_rx.recv() => Wake::Publish(event),
                _ = tick.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled | Wake::Command(None) => return None,
                Wake::Lost(lost) if self.is_current(lost.epoch) => {
                    if let Err(terminal) = self.reconnect(lost).await {
                        return terminal;
                    }
                    tick = self.ticker();
                }
                Wake::Lost(lost) => debug!(epoch = lost.epoch, "Ignoring loss of stale channel"),
                Wake::Command(Some(command)) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = self.handle_command(command) => {}
                    }
                }
                Wake::Publish(event) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = self.handle_publish(event) => {}
                    }
                }
                Wake::Tick => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = self.housekeeping() => {}
                    }
                }
            }
        }
    }

    fn ticker(&self) -> tokio::time::Interval {
        let period = self
            .sessions
            .keepalive_interval()
            .map(|interval| (interval / 4).clamp(MIN_TICK, MAX_TICK))
            .unwrap_or(MAX_TICK);
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick
    }

    async fn housekeeping(&mut self) {
        let Some(channel) = self.live_channel() else {
            return;
        };

        if let Err(error) = self.channels.renew_if_due().await {
            error.log("secure channel renewal");
            return;
        }

        if let Err(error) = self.sessions.keep_alive(&channel).await {
            self.shared.emit(ClientEvent::KeepAliveFailed {
                error: Arc::new(error.clone()),
            });
            channel.report_failure(format!("keep-alive failed: {error}"));
            return;
        }

        if !self.shared.registry.unrecovered().is_empty() {
            let cx = RecoveryContext {
                channel: &channel,
                session: &self.sessions,
                registry: &self.shared.registry,
            };
            match self.recovery.retry_unrecovered(cx).await {
                Ok(report) => self.announce(report),
                Err(error) => {
                    channel.report_failure(format!("subscription recovery failed: {error}"));
                    return;
                }
            }
        }

        self.ensure_publishing();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SyncSubscription { handle, reply } => {
                let result = self.sync_subscription(handle).await;
                if result.is_ok() {
                    self.ensure_publishing();
                }
                let _ = reply.send(result);
            }
            Command::SyncItems { handle, items, reply } => {
                let _ = reply.send(self.sync_items(handle, &items).await);
            }
            Command::Delete { server_id, reply } => {
                if let Some(channel) = self.live_channel() {
                    let cx = RecoveryContext {
                        channel: &channel,
                        session: &self.sessions,
                        registry: &self.shared.registry,
                    };
                    self.recovery.delete(cx, server_id).await;
                }
                if !self.shared.registry.has_bound() {
                    self.publish = None;
                }
                let _ = reply.send(());
            }
        }
    }

    async fn sync_subscription(&mut self, handle: SubscriptionHandle) -> UaResult<RecoveryOutcome> {
        let channel = self.live_channel().ok_or_else(UaError::not_connected)?;
        let registry = &self.shared.registry;
        if let Some(subscription_id) = registry.snapshot(handle)?.server_id {
            return Ok(RecoveryOutcome::Created { subscription_id });
        }

        let cx = RecoveryContext {
            channel: &channel,
            session: &self.sessions,
            registry,
        };
        match self.recovery.create(cx, handle, false).await {
            Ok(outcome) => Ok(outcome),
            Err(error) if needs_new_channel(&error) => {
                channel.report_failure(format!("CreateSubscription failed: {error}"));
                Err(error)
            }
            Err(error) => {
                // Rejected by the server; the caller gets the error instead.
                if let Ok(Some(server_id)) = registry.remove(handle) {
                    self.recovery.delete(cx, server_id).await;
                }
                Err(error)
            }
        }
    }

    async fn sync_items(&mut self, handle: SubscriptionHandle, items: &[MonitoredItem]) -> UaResult<usize> {
        let Some(channel) = self.live_channel() else {
            return Ok(0);
        };
        let Some(server_id) = self.shared.registry.snapshot(handle)?.server_id else {
            return Ok(0);
        };

        let cx = RecoveryContext {
            channel: &channel,
            session: &self.sessions,
            registry: &self.shared.registry,
        };
        let result = self.recovery.create_items(cx, handle, server_id, items).await;
        if let Err(error) = &result {
            if needs_new_channel(error) {
                channel.report_failure(format!("CreateMonitoredItems failed: {error}"));
            }
        }
        result
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    async fn handle_publish(&mut self, event: PublishEvent) {
        match event {
            PublishEvent::Response { epoch, response } if self.is_current(epoch) => {
                self.sessions.touch();
                self.deliver(response.subscription_id, response.notification_message)
                    .await;
                self.acknowledge();
            }
            PublishEvent::Failed { epoch, error } if self.is_current(epoch) => {
                self.publish = None;
                if needs_new_channel(&error) {
                    self.channels.report_failure(format!("publish failed: {error}"));
                } else {
                    error.log("publish");
                }
            }
            _ => {}
        }
    }

    async fn deliver(&mut self, server_id: u32, message: NotificationMessage) {
        let registry = &self.shared.registry;
        match registry.deliver(server_id, message) {
            Delivery::Delivered { .. } => self.shared.stats.record_notification(),
            Delivery::Gap {
                handle,
                server_id,
                missing,
                held,
            } => {
                let Some(channel) = self.live_channel() else {
                    return;
                };
                debug!(subscription = %handle, missing = ?missing, "Sequence gap, republishing");
                let cx = RecoveryContext {
                    channel: &channel,
                    session: &self.sessions,
                    registry,
                };
                let delivered = held.is_some();
                match self.recovery.repair_gap(cx, handle, server_id, missing, held).await {
                    Ok(lost) => {
                        if delivered {
                            self.shared.stats.record_notification();
                        }
                        for missing in lost {
                            self.shared.emit(ClientEvent::NotificationGap { handle, missing });
                        }
                    }
                    Err(error) if error.is_channel_failure() => {
                        channel.report_failure(format!("Republish failed: {error}"));
                    }
                    Err(error) => {
                        error.log("gap repair");
                        registry.set_state(handle, SubscriptionState::Failed);
                    }
                }
            }
            Delivery::Unknown => {
                debug!(subscription_id = server_id, "Notification for unknown subscription");
            }
            Delivery::KeepAlive { .. } | Delivery::Duplicate { .. } => {}
        }
    }

    fn acknowledge(&self) {
        if let Some(publish) = &self.publish {
            publish.acknowledge(self.shared.registry.take_acknowledgements());
        }
    }

    /// Starts the publish loop when subscriptions are bound and none runs on
    /// the live channel.
    fn ensure_publishing(&mut self) {
        let Some(channel) = self.live_channel() else {
            self.publish = None;
            return;
        };
        if let Some(publish) = &self.publish {
            if publish.epoch() == channel.epoch() && !publish.is_finished() {
                return;
            }
        }
        if !self.shared.registry.has_bound() {
            self.publish = None;
            return;
        }
        let Ok(token) = self.sessions.authentication_token() else {
            return;
        };

        let config = &self.shared.config;
        self.publish = Some(PublishLoop::spawn(
            channel,
            token,
            self.publish_timeout(),
            config.subscription_defaults.publishing_interval,
            self.publish_tx.clone(),
        ));
        self.acknowledge();
    }

    /// Longest time the server may hold a Publish before answering.
    fn publish_timeout(&self) -> Duration {
        let registry = &self.shared.registry;
        let longest = registry
            .handles()
            .into_iter()
            .filter_map(|handle| registry.info(handle)?.revised)
            .map(|r| r.publishing_interval.saturating_mul(r.max_keepalive_count.max(1)))
            .max()
            .unwrap_or_default();
        self.shared.config.request_timeout + longest
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn live_channel(&self) -> Option<Arc<Channel>> {
        self.channels.current().filter(|c| !c.is_lost()).cloned()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.channels.current().is_some_and(|c| c.epoch() == epoch)
    }

    fn announce(&self, report: RecoveryReport) {
        for (handle, outcome) in report.outcomes {
            self.shared
                .emit(ClientEvent::SubscriptionRecovered { handle, outcome });
        }
        for (handle, missing) in report.gaps {
            self.shared.emit(ClientEvent::NotificationGap { handle, missing });
        }
    }

    /// Tears everything down and emits the terminal `close`.
    async fn shutdown(&mut self, error: Option<UaError>) {
        self.shared.state.set(ConnectionState::Disconnecting);
        self.publish = None;

        let channel = self.live_channel();
        self.sessions.close(channel.as_deref(), true).await;
        self.channels.close().await;

        let registry = &self.shared.registry;
        for handle in registry.handles() {
            registry.unbind(handle);
            registry.set_state(handle, SubscriptionState::Pending);
        }
        *self.shared.session_id.write() = None;

        match &error {
            Some(error) => warn!(endpoint = %self.endpoint, error = %error, "Connection closed"),
            None => info!(endpoint = %self.endpoint, "Disconnected"),
        }
        self.shared.state.set(ConnectionState::Disconnected);
        self.shared.emit(ClientEvent::Close {
            error: error.map(Arc::new),
        });
    }
}

/// Failures that only a new channel and a session check can clear.
fn needs_new_channel(error: &UaError) -> bool {
    error.is_channel_failure() || error.kind() == ErrorKind::SessionExpired
}
