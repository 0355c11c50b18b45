// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Secure channel management.
//!
//! A [`Channel`] wraps one transport connection with an issued security
//! token. It is replaced on every reconnection; nothing survives across
//! channels except what the session and subscription layers keep.
//!
//! Loss detection is single-shot: the first transport close or error, or the
//! first [`Channel::report_failure`] from the keep-alive or publish paths,
//! yields exactly one [`ChannelLost`] on the manager's loss receiver. An
//! intentional [`SecureChannelManager::close`] never yields one.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ConnectionError, ServiceError, UaError, UaResult};
use crate::transport::{
    AuthenticationToken, HelloParameters, OpenSecureChannelRequest, RequestHeader,
    SecureChannelToken, SecurityTokenRequestType, ServiceRequest, ServiceResponse,
    TransportConnection, TransportEvent, UaTransport, PROTOCOL_VERSION,
};
use crate::types::{EndpointUrl, SecurityMode, SecurityPolicy};

/// Fraction of the token lifetime after which the token is renewed.
const RENEWAL_FRACTION: f64 = 0.75;

// =============================================================================
// ChannelLost
// =============================================================================

/// Notification that a channel died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLost {
    /// Server channel id.
    pub channel_id: u32,
    /// Local epoch of the lost channel.
    pub epoch: u64,
    /// What was observed.
    pub reason: String,
}

impl fmt::Display for ChannelLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {} lost: {}", self.channel_id, self.reason)
    }
}

// =============================================================================
// Channel
// =============================================================================

/// An open secure channel.
pub struct Channel {
    epoch: u64,
    endpoint: EndpointUrl,
    connection: Arc<dyn TransportConnection>,
    protocol_version: u32,
    security_mode: SecurityMode,
    security_policy: SecurityPolicy,
    token: Mutex<SecureChannelToken>,
    token_issued_at: Mutex<Instant>,
    created_at: Instant,
    request_handle: AtomicU32,
    lost: AtomicBool,
    shutdown: CancellationToken,
    loss_tx: mpsc::UnboundedSender<ChannelLost>,
}

impl Channel {
    /// Returns the local epoch. Strictly increasing per manager.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the server channel id.
    pub fn channel_id(&self) -> u32 {
        self.token.lock().channel_id
    }

    /// Returns a copy of the current token.
    pub fn token(&self) -> SecureChannelToken {
        self.token.lock().clone()
    }

    /// Returns the endpoint this channel is connected to.
    pub fn endpoint(&self) -> &EndpointUrl {
        &self.endpoint
    }

    /// Returns the protocol version negotiated in the Hello/Acknowledge exchange.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Returns the security mode.
    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    /// Returns the security policy.
    pub fn security_policy(&self) -> SecurityPolicy {
        self.security_policy
    }

    /// Returns when the channel was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns `true` once the channel was lost or closed.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Sends one service request bounded by `timeout`.
    ///
    /// A timeout or transport failure does not by itself mark the channel
    /// as lost; callers decide through [`report_failure`](Self::report_failure).
    pub async fn call(
        &self,
        authentication_token: Option<AuthenticationToken>,
        request: ServiceRequest,
        timeout: Duration,
    ) -> UaResult<ServiceResponse> {
        if self.is_lost() {
            return Err(UaError::connection(ConnectionError::closed(Some(
                "secure channel is closed".to_string(),
            ))));
        }

        let service = request.name();
        let header = RequestHeader {
            authentication_token,
            request_handle: self.request_handle.fetch_add(1, Ordering::Relaxed) + 1,
            timeout_hint: timeout,
        };

        match tokio::time::timeout(timeout, self.connection.send(header, request)).await {
            Ok(result) => result,
            Err(_) => Err(UaError::request_timeout(service, timeout)),
        }
    }

    /// Marks the channel as failed. The first call per channel emits a
    /// [`ChannelLost`] and closes the transport; later calls do nothing.
    pub fn report_failure(&self, reason: impl Into<String>) {
        if self
            .lost
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let lost = ChannelLost {
            channel_id: self.channel_id(),
            epoch: self.epoch,
            reason: reason.into(),
        };
        warn!(channel_id = lost.channel_id, epoch = lost.epoch, reason = %lost.reason, "Secure channel lost");

        self.shutdown.cancel();
        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move { connection.close().await });

        // The receiver may be gone when the client is shutting down.
        let _ = self.loss_tx.send(lost);
    }

    /// Closes the channel without reporting a loss.
    async fn close(&self) {
        if self
            .lost
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shutdown.cancel();
            self.connection.close().await;
            debug!(epoch = self.epoch, "Secure channel closed");
        }
    }

    fn renewal_due(&self, now: Instant) -> bool {
        let lifetime = self.token.lock().revised_lifetime;
        let issued = *self.token_issued_at.lock();
        now.duration_since(issued) >= lifetime.mul_f64(RENEWAL_FRACTION)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("epoch", &self.epoch)
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &*self.token.lock())
            .field("lost", &self.is_lost())
            .finish()
    }
}

// =============================================================================
// ChannelStats
// =============================================================================

/// Counters kept by the [`SecureChannelManager`].
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Channels opened.
    pub opened: AtomicU64,
    /// Failed open attempts.
    pub open_failures: AtomicU64,
    /// Token renewals.
    pub renewals: AtomicU64,
}

impl ChannelStats {
    /// Returns `(opened, open_failures, renewals)`.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.opened.load(Ordering::Relaxed),
            self.open_failures.load(Ordering::Relaxed),
            self.renewals.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// SecureChannelManager
// =============================================================================

/// Opens, renews and closes secure channels.
pub struct SecureChannelManager {
    transport: Arc<dyn UaTransport>,
    security_mode: SecurityMode,
    security_policy: SecurityPolicy,
    requested_lifetime: Duration,
    request_timeout: Duration,
    endpoint_must_exist: bool,
    current: Option<Arc<Channel>>,
    next_epoch: u64,
    loss_tx: mpsc::UnboundedSender<ChannelLost>,
    stats: ChannelStats,
}

impl SecureChannelManager {
    /// Creates a manager and the receiver on which channel losses arrive.
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn UaTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelLost>) {
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            security_mode: config.security_mode,
            security_policy: config.security_policy,
            requested_lifetime: config.secure_channel_lifetime,
            request_timeout: config.request_timeout,
            endpoint_must_exist: config.endpoint_must_exist,
            current: None,
            next_epoch: 0,
            loss_tx,
            stats: ChannelStats::default(),
        };
        (manager, loss_rx)
    }

    /// Returns the current channel, lost or not.
    pub fn current(&self) -> Option<&Arc<Channel>> {
        self.current.as_ref()
    }

    /// Returns the counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Opens a new channel to `endpoint`.
    ///
    /// One attempt bounded by `timeout`; retrying is the caller's business.
    /// Any previous channel is closed first.
    pub async fn open(&mut self, endpoint: &EndpointUrl, timeout: Duration) -> UaResult<Arc<Channel>> {
        self.close().await;

        self.next_epoch += 1;
        let epoch = self.next_epoch;

        let result = match tokio::time::timeout(timeout, self.establish(endpoint, epoch)).await {
            Ok(result) => result,
            Err(_) => Err(UaError::connection(ConnectionError::timed_out(
                endpoint.as_str(),
                timeout,
            ))),
        };

        match result {
            Ok(channel) => {
                self.stats.opened.fetch_add(1, Ordering::Relaxed);
                info!(
                    endpoint = %endpoint,
                    channel_id = channel.channel_id(),
                    epoch,
                    "Secure channel opened"
                );
                self.current = Some(Arc::clone(&channel));
                Ok(channel)
            }
            Err(error) => {
                self.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    async fn establish(&self, endpoint: &EndpointUrl, epoch: u64) -> UaResult<Arc<Channel>> {
        let hello = HelloParameters::new(endpoint);
        let connection = self.transport.connect(endpoint, &hello).await?;

        match self.handshake(&connection, endpoint, epoch).await {
            Ok(channel) => Ok(channel),
            Err(error) => {
                connection.close().await;
                Err(error)
            }
        }
    }

    async fn handshake(
        &self,
        connection: &Arc<dyn TransportConnection>,
        endpoint: &EndpointUrl,
        epoch: u64,
    ) -> UaResult<Arc<Channel>> {
        let server_version = connection.protocol_version();
        if server_version != PROTOCOL_VERSION {
            return Err(UaError::connection(ConnectionError::ProtocolVersionMismatch {
                client: PROTOCOL_VERSION,
                server: server_version,
            }));
        }

        let token = connection
            .open_secure_channel(OpenSecureChannelRequest {
                request_type: SecurityTokenRequestType::Issue,
                security_mode: self.security_mode,
                security_policy: self.security_policy,
                requested_lifetime: self.requested_lifetime,
            })
            .await?;

        let events = connection.take_events();
        let now = Instant::now();
        let channel = Arc::new(Channel {
            epoch,
            endpoint: endpoint.clone(),
            connection: Arc::clone(connection),
            protocol_version: server_version,
            security_mode: self.security_mode,
            security_policy: self.security_policy,
            token: Mutex::new(token),
            token_issued_at: Mutex::new(now),
            created_at: now,
            request_handle: AtomicU32::new(0),
            lost: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            loss_tx: self.loss_tx.clone(),
        });

        if self.endpoint_must_exist {
            if let Err(error) = self.check_endpoint(&channel).await {
                channel.lost.store(true, Ordering::Release);
                return Err(error);
            }
        }

        if let Some(events) = events {
            tokio::spawn(watch_transport(Arc::clone(&channel), events));
        }

        Ok(channel)
    }

    async fn check_endpoint(&self, channel: &Channel) -> UaResult<()> {
        let response = channel
            .call(
                None,
                ServiceRequest::GetEndpoints {
                    endpoint_url: channel.endpoint.to_string(),
                },
                self.request_timeout,
            )
            .await?;

        let ServiceResponse::GetEndpoints { endpoints } = response else {
            return Err(unexpected_response("GetEndpoints"));
        };

        let found = endpoints.iter().any(|description| {
            channel.endpoint.matches(&description.endpoint_url)
                && description.security_mode == self.security_mode
                && description.security_policy == self.security_policy
        });

        if found {
            Ok(())
        } else {
            Err(UaError::connection(ConnectionError::endpoint_not_found(
                channel.endpoint.as_str(),
            )))
        }
    }

    /// Reports a failure on the current channel.
    pub fn report_failure(&self, reason: impl Into<String>) {
        if let Some(channel) = &self.current {
            channel.report_failure(reason);
        }
    }

    /// Renews the current token once 75 % of its lifetime has passed.
    ///
    /// Returns `Ok(true)` when a renewal happened. A failed renewal reports
    /// the channel as lost.
    pub async fn renew_if_due(&self) -> UaResult<bool> {
        let Some(channel) = self.current.as_ref().filter(|c| !c.is_lost()) else {
            return Ok(false);
        };
        if !channel.renewal_due(Instant::now()) {
            return Ok(false);
        }

        let request = OpenSecureChannelRequest {
            request_type: SecurityTokenRequestType::Renew,
            security_mode: channel.security_mode,
            security_policy: channel.security_policy,
            requested_lifetime: self.requested_lifetime,
        };
        let result = tokio::time::timeout(
            self.request_timeout,
            channel.connection.open_secure_channel(request),
        )
        .await
        .unwrap_or_else(|_| Err(UaError::request_timeout("OpenSecureChannel", self.request_timeout)));

        match result {
            Ok(token) => {
                debug!(
                    channel_id = token.channel_id,
                    token_id = token.token_id,
                    lifetime = ?token.revised_lifetime,
                    "Secure channel token renewed"
                );
                *channel.token.lock() = token;
                *channel.token_issued_at.lock() = Instant::now();
                self.stats.renewals.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(error) => {
                channel.report_failure(format!("token renewal failed: {error}"));
                Err(error)
            }
        }
    }

    /// Closes the current channel, if any, without reporting a loss.
    pub async fn close(&mut self) {
        if let Some(channel) = self.current.take() {
            channel.close().await;
        }
    }
}

impl fmt::Debug for SecureChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannelManager")
            .field("transport", &self.transport.name())
            .field("security_mode", &self.security_mode)
            .field("security_policy", &self.security_policy)
            .field("current", &self.current)
            .finish()
    }
}

async fn watch_transport(
    channel: Arc<Channel>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    tokio::select! {
        _ = channel.shutdown.cancelled() => {}
        event = events.recv() => {
            let reason = match event {
                Some(event) => event.to_string(),
                None => "transport event stream ended".to_string(),
            };
            channel.report_failure(reason);
        }
    }
}

pub(crate) fn unexpected_response(service: &'static str) -> UaError {
    UaError::Service(ServiceError::UnexpectedResponse { service })
}

// =============================================================================
// Tests
// =============================================================================
