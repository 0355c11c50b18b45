// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The application-facing client handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::driver::{Command, Driver, Shared};
use super::events::{ClientStats, EventStream};
use super::state::ConnectionState;
use crate::backoff::BackoffCanceller;
use crate::config::ClientConfig;
use crate::error::{ErrorKind, UaError, UaResult};
use crate::subscription::{
    MonitoredItem, SubscriptionHandle, SubscriptionInfo, SubscriptionParameters, SubscriptionStream,
};
use crate::transport::UaTransport;
use crate::types::{EndpointUrl, NodeId};

/// Running driver of one connection lifetime.
struct DriverHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    backoff: BackoffCanceller,
    join: JoinHandle<()>,
}

impl DriverHandle {
    fn stop(&self) {
        self.backoff.cancel();
        self.cancel.cancel();
    }
}

/// OPC UA client that keeps its connection, session and subscriptions
/// alive across network outages.
///
/// After [`connect`](Self::connect) succeeds, a lost connection is recovered
/// in the background according to the configured
/// [`ConnectionStrategy`](crate::ConnectionStrategy): the secure channel is
/// reopened, the session re-activated or recreated, and every subscription
/// resumed or recreated. Progress is reported through [`events`](Self::events).
///
/// # Example
///
/// ```rust,ignore
/// use trap_ua_client::{ClientConfig, ClientEvent, UaClient};
///
/// let client = UaClient::new(ClientConfig::new("opc.tcp://plc:4840"), transport)?;
/// let mut events = client.events();
/// client.connect().await?;
///
/// while let Some(event) = events.recv().await {
///     if let ClientEvent::Close { error } = event {
///         eprintln!("connection closed: {error:?}");
///         break;
///     }
/// }
/// ```
pub struct UaClient {
    shared: Arc<Shared>,
    transport: Arc<dyn UaTransport>,
    driver: Mutex<Option<DriverHandle>>,
    next_driver_id: AtomicU64,
}

impl UaClient {
    /// Creates a client. Nothing is sent until [`connect`](Self::connect).
    pub fn new(config: ClientConfig, transport: Arc<dyn UaTransport>) -> UaResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config)),
            transport,
            driver: Mutex::new(None),
            next_driver_id: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to the configured endpoint.
    ///
    /// Resolves once: `Ok` on the first successful attempt, the terminal
    /// error once retries are exhausted, or a `UserCancelled` error when
    /// [`disconnect`](Self::disconnect) interrupts it. Fails immediately with
    /// an `InvalidState` error if the client is not disconnected.
    pub async fn connect(&self) -> UaResult<()> {
        let endpoint = self.shared.config.endpoint_url()?;
        self.connect_endpoint(endpoint).await
    }

    /// Connects to `endpoint` instead of the configured one.
    pub async fn connect_to(&self, endpoint: &str) -> UaResult<()> {
        let endpoint = EndpointUrl::parse(endpoint)?;
        self.connect_endpoint(endpoint).await
    }

    async fn connect_endpoint(&self, endpoint: EndpointUrl) -> UaResult<()> {
        let (id, ready) = {
            let mut slot = self.driver.lock().await;
            self.shared
                .state
                .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
                .map_err(|state| UaError::invalid_state("connect", state.to_string()))?;

            // A driver that ended on its own is still joined here.
            if let Some(previous) = slot.take() {
                let _ = previous.join.await;
            }

            let id = self.next_driver_id.fetch_add(1, Ordering::Relaxed);
            let (commands, command_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let (driver, backoff) = Driver::new(
                Arc::clone(&self.shared),
                endpoint,
                Arc::clone(&self.transport),
                command_rx,
                cancel.clone(),
            );
            let (ready_tx, ready_rx) = oneshot::channel();
            let join = tokio::spawn(driver.run(ready_tx));

            *slot = Some(DriverHandle {
                id,
                commands,
                cancel,
                backoff,
                join,
            });
            (id, ready_rx)
        };

        match ready.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                self.join_driver(id).await;
                Err(error)
            }
            Err(_) => {
                self.join_driver(id).await;
                Err(UaError::cancelled())
            }
        }
    }

    /// Waits for driver `id` to finish, unless someone else already did.
    async fn join_driver(&self, id: u64) {
        let mut slot = self.driver.lock().await;
        if slot.as_ref().is_some_and(|driver| driver.id == id) {
            if let Some(driver) = slot.take() {
                let _ = driver.join.await;
            }
        }
    }

    /// Disconnects and stops any reconnection in progress.
    ///
    /// Cancels pending backoff timers and in-flight attempts, closes the
    /// session and the channel, and resolves a pending `connect()` with a
    /// `UserCancelled` error. Returns after `close` has been emitted. Calling
    /// it on a disconnected client does nothing.
    pub async fn disconnect(&self) -> UaResult<()> {
        let mut slot = self.driver.lock().await;
        let Some(driver) = slot.take() else {
            return Ok(());
        };

        debug!(state = %self.state(), "Disconnect requested");
        driver.stop();
        driver
            .join
            .await
            .map_err(|error| UaError::closed(format!("connection driver failed: {error}")))?;
        info!("Client disconnected");
        Ok(())
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Returns a receiver that observes state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.watch()
    }

    /// Returns `true` while a lost connection is being recovered.
    pub fn is_reconnecting(&self) -> bool {
        self.state().is_reconnecting()
    }

    /// Returns `true` when connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribes to lifecycle events. Only events emitted after this call
    /// are received.
    pub fn events(&self) -> EventStream {
        self.shared.events.subscribe()
    }

    /// Returns the client counters.
    pub fn stats(&self) -> &ClientStats {
        &self.shared.stats
    }

    /// Returns the id of the current session.
    pub fn session_id(&self) -> Option<NodeId> {
        self.shared.session_id.read().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Creates a subscription.
    ///
    /// When connected, the subscription is created on the server before
    /// this returns and a rejection is returned as an error. Otherwise it is
    /// created once the client connects. It survives reconnections and
    /// `disconnect()`/`connect()` cycles until deleted.
    pub async fn create_subscription(&self, parameters: SubscriptionParameters) -> UaResult<SubscriptionStream> {
        parameters.validate()?;
        let stream = self.shared.registry.insert(parameters);
        let handle = stream.handle();
        debug!(subscription = %handle, "Subscription registered");

        if self.is_connected() {
            let result = self
                .request(|reply| Command::SyncSubscription { handle, reply })
                .await
                .and_then(|result| result);
            match result {
                Ok(outcome) => debug!(subscription = %handle, outcome = %outcome, "Subscription created"),
                Err(error) if defers_to_recovery(&error) => {
                    debug!(subscription = %handle, error = %error, "Subscription creation deferred");
                }
                Err(error) => {
                    let _ = self.shared.registry.remove(handle);
                    return Err(error);
                }
            }
        }
        Ok(stream)
    }

    /// Adds monitored items to a subscription.
    ///
    /// Returns the items with their assigned client handles. Items the
    /// server rejects stay defined but unbound and are logged.
    pub async fn add_monitored_items(
        &self,
        handle: SubscriptionHandle,
        items: Vec<MonitoredItem>,
    ) -> UaResult<Vec<MonitoredItem>> {
        let added = self.shared.registry.add_items(handle, items)?;

        if self.is_connected() {
            let items = added.clone();
            let result = self
                .request(|reply| Command::SyncItems { handle, items, reply })
                .await
                .and_then(|result| result);
            match result {
                Ok(0) => {}
                Ok(rejected) => debug!(subscription = %handle, rejected, "Monitored items rejected"),
                Err(error) if defers_to_recovery(&error) => {
                    debug!(subscription = %handle, error = %error, "Monitored item creation deferred");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(added)
    }

    /// Deletes a subscription locally and, when connected, on the server.
    pub async fn delete_subscription(&self, handle: SubscriptionHandle) -> UaResult<()> {
        let server_id = self.shared.registry.remove(handle)?;
        if let (Some(server_id), true) = (server_id, self.is_connected()) {
            // Best effort; the session close deletes it otherwise.
            let _ = self.request(|reply| Command::Delete { server_id, reply }).await;
        }
        debug!(subscription = %handle, "Subscription deleted");
        Ok(())
    }

    /// Returns a view of a subscription.
    pub fn subscription(&self, handle: SubscriptionHandle) -> Option<SubscriptionInfo> {
        self.shared.registry.info(handle)
    }

    /// Returns the handles of all subscriptions.
    pub fn subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.shared.registry.handles()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> UaResult<T> {
        let commands = self
            .driver
            .lock()
            .await
            .as_ref()
            .map(|driver| driver.commands.clone())
            .ok_or_else(UaError::not_connected)?;

        let (reply, response) = oneshot::channel();
        commands
            .send(command(reply))
            .map_err(|_| UaError::not_connected())?;
        response.await.map_err(|_| UaError::cancelled())
    }
}

/// Errors after which the driver creates the subscription itself later.
fn defers_to_recovery(error: &UaError) -> bool {
    error.is_channel_failure()
        || matches!(
            error.kind(),
            ErrorKind::UserCancelled | ErrorKind::SessionExpired
        )
}

impl Drop for UaClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().as_ref() {
            driver.stop();
        }
    }
}

impl fmt::Debug for UaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UaClient")
            .field("endpoint", &self.shared.config.endpoint)
            .field("state", &self.state())
            .field("transport", &self.transport.name())
            .field("subscriptions", &self.shared.registry.len())
            .finish()
    }
}
