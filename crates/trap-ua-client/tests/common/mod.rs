// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-memory OPC UA server and transport shared by the integration tests.
//!
//! The server keeps sessions, subscriptions, monitored items and a
//! retransmission queue per subscription, and expires sessions and
//! subscriptions the way a real server does: lazily, when their timeout has
//! passed without traffic. Network outages are simulated by refusing new
//! connections and closing the live ones.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use trap_ua_client::transport::{
    AuthenticationToken, DataValue, EndpointDescription, HelloParameters,
    MonitoredItemCreateResult, MonitoredItemNotification, NotificationMessage,
    OpenSecureChannelRequest, PublishResponse, RequestHeader, SecureChannelToken,
    SecurityTokenRequestType, ServiceRequest, ServiceResponse, TransferResult, TransportConnection, TransportEvent, UaTransport, Variant,
    PROTOCOL_VERSION,
};
use trap_ua_client::{
    ClientConfig, ClientEvent, ConnectionStrategy, EndpointUrl, EventStream, MaxRetry,
    MonitoredItem, NodeId, StatusCode, SubscriptionDefaults, UaError, UaResult,
};

pub const ENDPOINT: &str = "opc.tcp://sim-server:4840/ua";

/// Longest time the server holds a Publish request before re-checking.
const PUBLISH_POLL: Duration = Duration::from_millis(5);

// =============================================================================
// Configuration helpers
// =============================================================================

/// Retry strategy without jitter.
pub fn strategy(max_retry: MaxRetry, initial_ms: u64, max_ms: u64) -> ConnectionStrategy {
    ConnectionStrategy::default()
        .with_max_retry(max_retry)
        .with_initial_delay(Duration::from_millis(initial_ms))
        .with_max_delay(Duration::from_millis(max_ms))
        .with_randomisation_factor(0.0)
}

/// Client configuration with test-sized timeouts.
///
/// Session timeout 3 s; subscriptions publish every 20 ms, keep-alive after
/// 5 intervals and expire after 25 intervals (500 ms) without Publish.
pub fn config(strategy: ConnectionStrategy) -> ClientConfig {
    ClientConfig::builder()
        .endpoint(ENDPOINT)
        .application_name("trap-ua-client tests")
        .requested_session_timeout(Duration::from_secs(3))
        .connect_timeout(Duration::from_millis(300))
        .request_timeout(Duration::from_millis(300))
        .keepalive_timeout(Duration::from_millis(300))
        .republish_timeout(Duration::from_millis(300))
        .connection_strategy(strategy)
        .subscription_defaults(SubscriptionDefaults {
            publishing_interval: Duration::from_millis(20),
            lifetime_count: 25,
            max_keepalive_count: 5,
            ..SubscriptionDefaults::default()
        })
        .build()
        .expect("test configuration is valid")
}

// =============================================================================
// Event helpers
// =============================================================================

/// Waits for the next event.
pub async fn next_event(events: &mut EventStream, within: Duration) -> Option<ClientEvent> {
    tokio::time::timeout(within, events.recv()).await.ok().flatten()
}

/// Collects events until one named `name` arrives. Panics after `within`.
pub async fn collect_until(events: &mut EventStream, name: &str, within: Duration) -> Vec<ClientEvent> {
    let deadline = Instant::now() + within;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) => {
                let done = event.name() == name;
                seen.push(event);
                if done {
                    return seen;
                }
            }
            _ => panic!(
                "no '{name}' event within {within:?}; saw {:?}",
                seen.iter().map(ClientEvent::name).collect::<Vec<_>>()
            ),
        }
    }
}

/// Collects whatever arrives within `within`.
pub async fn collect_for(events: &mut EventStream, within: Duration) -> Vec<ClientEvent> {
    let deadline = Instant::now() + within;
    let mut seen = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(deadline.saturating_duration_since(Instant::now()), events.recv()).await
    {
        seen.push(event);
    }
    seen
}

pub fn count(events: &[ClientEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

pub fn names(events: &[ClientEvent]) -> Vec<&'static str> {
    events.iter().map(ClientEvent::name).collect()
}

/// Polls `condition` every few milliseconds. Panics after `within`.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + within;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {within:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Simulated server
// =============================================================================

#[derive(Debug)]
struct SimSession {
    session_id: NodeId,
    timeout: Duration,
    last_seen: Instant,
    activated: bool,
}

#[derive(Debug)]
struct SimSubscription {
    session: Option<AuthenticationToken>,
    publishing_interval: Duration,
    lifetime: Duration,
    keepalive: Duration,
    items: Vec<(u32, MonitoredItem)>,
    next_sequence_number: u32,
    queue: VecDeque<Vec<MonitoredItemNotification>>,
    retransmission: BTreeMap<u32, NotificationMessage>,
    last_publish: Instant,
    last_message: Instant,
}

impl SimSubscription {
    fn take_sequence_number(&mut self) -> u32 {
        let n = self.next_sequence_number;
        self.next_sequence_number = n.wrapping_add(1).max(1);
        n
    }
}

struct Link {
    id: u64,
    closed: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
}

struct Inner {
    online: bool,
    protocol_version: u32,
    reject_identity: bool,
    retention: usize,
    links: Vec<Link>,
    next_link: u64,
    next_channel_id: u32,
    next_session: u32,
    next_subscription_id: u32,
    next_item_id: u32,
    sessions: HashMap<AuthenticationToken, SimSession>,
    subscriptions: BTreeMap<u32, SimSubscription>,
    faults: HashMap<&'static str, VecDeque<StatusCode>>,
    stalled: HashSet<&'static str>,
    calls: HashMap<&'static str, u64>,
}

/// Simulated server.
pub struct SimServer {
    inner: Mutex<Inner>,
    notify: Notify,
    connects: AtomicU64,
}

impl SimServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                online: true,
                protocol_version: PROTOCOL_VERSION,
                reject_identity: false,
                retention: 64,
                links: Vec::new(),
                next_link: 0,
                next_channel_id: 0,
                next_session: 0,
                next_subscription_id: 100,
                next_item_id: 0,
                sessions: HashMap::new(),
                subscriptions: BTreeMap::new(),
                faults: HashMap::new(),
                stalled: HashSet::new(),
                calls: HashMap::new(),
            }),
            notify: Notify::new(),
            connects: AtomicU64::new(0),
        })
    }

    /// Transport that connects to this server.
    pub fn transport(self: &Arc<Self>) -> Arc<dyn UaTransport> {
        Arc::new(SimTransport {
            server: Arc::clone(self),
        })
    }

    // -------------------------------------------------------------------------
    // Outages
    // -------------------------------------------------------------------------

    /// Drops every connection and refuses new ones. State is kept.
    pub fn go_offline(&self) {
        let mut inner = self.inner.lock();
        inner.online = false;
        for link in inner.links.drain(..) {
            link.closed.cancel();
            let _ = link.events.send(TransportEvent::Closed {
                reason: Some("server went offline".to_string()),
            });
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn go_online(&self) {
        self.inner.lock().online = true;
    }

    /// Closes live connections with a transport error but stays reachable.
    pub fn break_connections(&self) {
        let mut inner = self.inner.lock();
        for link in inner.links.drain(..) {
            link.closed.cancel();
            let _ = link.events.send(TransportEvent::Error {
                message: "connection reset by peer".to_string(),
            });
        }
    }

    /// Restarts with empty state.
    pub fn restart(&self) {
        self.go_offline();
        let mut inner = self.inner.lock();
        inner.sessions.clear();
        inner.subscriptions.clear();
        inner.online = true;
    }

    // -------------------------------------------------------------------------
    // Behavior
    // -------------------------------------------------------------------------

    pub fn set_protocol_version(&self, version: u32) {
        self.inner.lock().protocol_version = version;
    }

    pub fn reject_identity(&self, reject: bool) {
        self.inner.lock().reject_identity = reject;
    }

    /// Number of unacknowledged messages kept per subscription.
    pub fn set_retention(&self, retention: usize) {
        self.inner.lock().retention = retention;
    }

    /// Fails the next call of `service` with `status`.
    pub fn inject_fault(&self, service: &'static str, status: StatusCode) {
        self.inner
            .lock()
            .faults
            .entry(service)
            .or_default()
            .push_back(status);
    }

    /// Leaves calls of `service` unanswered until the connection closes.
    pub fn stall(&self, service: &'static str) {
        self.inner.lock().stalled.insert(service);
    }

    pub fn resume(&self, service: &'static str) {
        self.inner.lock().stalled.remove(service);
    }

    /// Forgets every session; subscriptions survive until their lifetime.
    pub fn expire_sessions(&self) {
        let mut inner = self.inner.lock();
        inner.sessions.clear();
        for subscription in inner.subscriptions.values_mut() {
            subscription.session = None;
        }
    }

    // -------------------------------------------------------------------------
    // Data
    // -------------------------------------------------------------------------

    /// Queues a data change for every item monitoring `node_id`.
    pub fn publish_value(&self, node_id: &NodeId, value: impl Into<Variant>) {
        let value = DataValue::new(value);
        let mut inner = self.inner.lock();
        for subscription in inner.subscriptions.values_mut() {
            let changes: Vec<_> = subscription
                .items
                .iter()
                .filter(|(_, item)| &item.node_id == node_id)
                .map(|(_, item)| MonitoredItemNotification {
                    client_handle: item.client_handle,
                    value: value.clone(),
                })
                .collect();
            if !changes.is_empty() {
                subscription.queue.push_back(changes);
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Sends a data change whose Publish response never reaches the client.
    pub fn publish_value_lost(&self, node_id: &NodeId, value: impl Into<Variant>) {
        let value = DataValue::new(value);
        let mut inner = self.inner.lock();
        let retention = inner.retention;
        for subscription in inner.subscriptions.values_mut() {
            let changes: Vec<_> = subscription
                .items
                .iter()
                .filter(|(_, item)| &item.node_id == node_id)
                .map(|(_, item)| MonitoredItemNotification {
                    client_handle: item.client_handle,
                    value: value.clone(),
                })
                .collect();
            if changes.is_empty() {
                continue;
            }
            let sequence_number = subscription.take_sequence_number();
            retain(
                subscription,
                retention,
                NotificationMessage {
                    sequence_number,
                    publish_time: Utc::now(),
                    data_changes: changes,
                },
            );
        }
    }

    /// Drops all unacknowledged messages.
    pub fn discard_retransmissions(&self) {
        for subscription in self.inner.lock().subscriptions.values_mut() {
            subscription.retransmission.clear();
        }
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    pub fn calls(&self, service: &str) -> u64 {
        self.inner.lock().calls.get(service).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn subscription_ids(&self) -> Vec<u32> {
        self.inner.lock().subscriptions.keys().copied().collect()
    }

    pub fn monitored_items(&self, subscription_id: u32) -> Vec<MonitoredItem> {
        self.inner
            .lock()
            .subscriptions
            .get(&subscription_id)
            .map(|s| s.items.iter().map(|(_, item)| item.clone()).collect())
            .unwrap_or_default()
    }

    pub fn live_connections(&self) -> usize {
        self.inner.lock().links.len()
    }

    // -------------------------------------------------------------------------
    // Service dispatch
    // -------------------------------------------------------------------------

    async fn handle(&self, header: RequestHeader, request: ServiceRequest) -> UaResult<ServiceResponse> {
        let service = request.name();
        let stalled = {
            let mut inner = self.inner.lock();
            *inner.calls.entry(service).or_default() += 1;
            if let Some(status) = inner.faults.get_mut(service).and_then(VecDeque::pop_front) {
                return Err(UaError::service_fault(service, status));
            }
            inner.stalled.contains(service)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        if let ServiceRequest::Publish { acknowledgements } = request {
            let token = self.session_token(&header)?;
            {
                let mut inner = self.inner.lock();
                for ack in acknowledgements {
                    if let Some(subscription) = inner.subscriptions.get_mut(&ack.subscription_id) {
                        subscription.retransmission.remove(&ack.sequence_number);
                    }
                }
            }
            return self.publish(token).await;
        }

        let mut inner = self.inner.lock();
        expire(&mut inner);

        match request {
            ServiceRequest::GetEndpoints { .. } => Ok(ServiceResponse::GetEndpoints {
                endpoints: vec![EndpointDescription {
                    endpoint_url: ENDPOINT.to_string(),
                    security_mode: Default::default(),
                    security_policy: Default::default(),
                }],
            }),
            ServiceRequest::CreateSession {
                requested_timeout, ..
            } => {
                inner.next_session += 1;
                let token = AuthenticationToken::new_random();
                let session_id = NodeId::numeric(1, 1000 + inner.next_session);
                inner.sessions.insert(
                    token,
                    SimSession {
                        session_id: session_id.clone(),
                        timeout: requested_timeout,
                        last_seen: Instant::now(),
                        activated: false,
                    },
                );
                Ok(ServiceResponse::CreateSession {
                    session_id,
                    authentication_token: token,
                    revised_timeout: requested_timeout,
                })
            }
            ServiceRequest::ActivateSession { .. } => {
                if inner.reject_identity {
                    return Err(UaError::service_fault(
                        "ActivateSession",
                        StatusCode::BAD_IDENTITY_TOKEN_REJECTED,
                    ));
                }
                let session = touch_session(&mut inner, &header)?;
                session.activated = true;
                Ok(ServiceResponse::ActivateSession)
            }
            ServiceRequest::CloseSession {
                delete_subscriptions,
            } => {
                let token = header
                    .authentication_token
                    .ok_or_else(|| UaError::service_fault("CloseSession", StatusCode::BAD_SESSION_ID_INVALID))?;
                inner.sessions.remove(&token);
                if delete_subscriptions {
                    inner.subscriptions.retain(|_, s| s.session != Some(token));
                }
                Ok(ServiceResponse::CloseSession)
            }
            ServiceRequest::Read { .. } => {
                touch_session(&mut inner, &header)?;
                Ok(ServiceResponse::Read {
                    value: DataValue::new(Utc::now()),
                })
            }
            ServiceRequest::CreateSubscription { parameters } => {
                let token = activated_session(&mut inner, &header)?;
                inner.next_subscription_id += 1;
                let subscription_id = inner.next_subscription_id;
                let now = Instant::now();
                inner.subscriptions.insert(
                    subscription_id,
                    SimSubscription {
                        session: Some(token),
                        publishing_interval: parameters.publishing_interval,
                        lifetime: parameters.lifetime(),
                        keepalive: parameters
                            .publishing_interval
                            .saturating_mul(parameters.max_keepalive_count),
                        items: Vec::new(),
                        next_sequence_number: 1,
                        queue: VecDeque::new(),
                        retransmission: BTreeMap::new(),
                        last_publish: now,
                        last_message: now,
                    },
                );
                Ok(ServiceResponse::CreateSubscription {
                    subscription_id,
                    revised_publishing_interval: parameters.publishing_interval,
                    revised_lifetime_count: parameters.lifetime_count,
                    revised_max_keepalive_count: parameters.max_keepalive_count,
                })
            }
            ServiceRequest::CreateMonitoredItems {
                subscription_id,
                items,
            } => {
                activated_session(&mut inner, &header)?;
                if !inner.subscriptions.contains_key(&subscription_id) {
                    return Err(subscription_invalid("CreateMonitoredItems"));
                }
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    if item.node_id == NodeId::string(0, "Invalid") {
                        results.push(MonitoredItemCreateResult {
                            status: StatusCode::BAD_NODE_ID_UNKNOWN,
                            monitored_item_id: 0,
                            revised_sampling_interval: Duration::ZERO,
                            revised_queue_size: 0,
                        });
                        continue;
                    }
                    inner.next_item_id += 1;
                    let monitored_item_id = inner.next_item_id;
                    results.push(MonitoredItemCreateResult {
                        status: StatusCode::GOOD,
                        monitored_item_id,
                        revised_sampling_interval: item.sampling_interval,
                        revised_queue_size: item.queue_size,
                    });
                    if let Some(subscription) = inner.subscriptions.get_mut(&subscription_id) {
                        subscription.items.push((monitored_item_id, item));
                    }
                }
                Ok(ServiceResponse::CreateMonitoredItems { results })
            }
            ServiceRequest::DeleteSubscriptions { subscription_ids } => {
                activated_session(&mut inner, &header)?;
                let results = subscription_ids
                    .iter()
                    .map(|id| match inner.subscriptions.remove(id) {
                        Some(_) => StatusCode::GOOD,
                        None => StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                    })
                    .collect();
                Ok(ServiceResponse::DeleteSubscriptions { results })
            }
            ServiceRequest::Republish {
                subscription_id,
                retransmit_sequence_number,
            } => {
                activated_session(&mut inner, &header)?;
                let subscription = inner
                    .subscriptions
                    .get(&subscription_id)
                    .ok_or_else(|| subscription_invalid("Republish"))?;
                subscription
                    .retransmission
                    .get(&retransmit_sequence_number)
                    .cloned()
                    .map(|notification_message| ServiceResponse::Republish {
                        notification_message,
                    })
                    .ok_or_else(|| {
                        UaError::service_fault("Republish", StatusCode::BAD_MESSAGE_NOT_AVAILABLE)
                    })
            }
            ServiceRequest::TransferSubscriptions {
                subscription_ids, ..
            } => {
                let token = activated_session(&mut inner, &header)?;
                let results = subscription_ids
                    .iter()
                    .map(|id| match inner.subscriptions.get_mut(id) {
                        Some(subscription) => {
                            subscription.session = Some(token);
                            subscription.last_publish = Instant::now();
                            TransferResult {
                                status: StatusCode::GOOD,
                                available_sequence_numbers: subscription
                                    .retransmission
                                    .keys()
                                    .copied()
                                    .collect(),
                            }
                        }
                        None => TransferResult {
                            status: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                            available_sequence_numbers: Vec::new(),
                        },
                    })
                    .collect();
                Ok(ServiceResponse::TransferSubscriptions { results })
            }
            ServiceRequest::Publish { .. } => unreachable!("handled above"),
        }
    }

    fn session_token(&self, header: &RequestHeader) -> UaResult<AuthenticationToken> {
        let mut inner = self.inner.lock();
        expire(&mut inner);
        activated_session(&mut inner, header)
    }

    /// Holds the request until a message or a keep-alive is due.
    async fn publish(&self, token: AuthenticationToken) -> UaResult<ServiceResponse> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                expire(&mut inner);
                if !inner.sessions.contains_key(&token) {
                    return Err(UaError::service_fault("Publish", StatusCode::BAD_SESSION_ID_INVALID));
                }
                if let Some(response) = next_message(&mut inner, token) {
                    return response;
                }
            }
            let _ = tokio::time::timeout(PUBLISH_POLL, notified).await;
        }
    }
}

fn subscription_invalid(service: &'static str) -> UaError {
    UaError::service_fault(service, StatusCode::BAD_SUBSCRIPTION_ID_INVALID)
}

fn retain(subscription: &mut SimSubscription, retention: usize, message: NotificationMessage) {
    subscription
        .retransmission
        .insert(message.sequence_number, message);
    while subscription.retransmission.len() > retention {
        subscription.retransmission.pop_first();
    }
}

fn expire(inner: &mut Inner) {
    let now = Instant::now();
    inner
        .sessions
        .retain(|_, s| now.duration_since(s.last_seen) <= s.timeout);
    let live: Vec<AuthenticationToken> = inner.sessions.keys().copied().collect();
    for subscription in inner.subscriptions.values_mut() {
        if subscription.session.is_some_and(|token| !live.contains(&token)) {
            subscription.session = None;
        }
    }
    inner
        .subscriptions
        .retain(|_, s| now.duration_since(s.last_publish) <= s.lifetime);
}

fn touch_session<'a>(inner: &'a mut Inner, header: &RequestHeader) -> UaResult<&'a mut SimSession> {
    let session = match header.authentication_token {
        Some(token) => inner.sessions.get_mut(&token),
        None => None,
    };
    let Some(session) = session else {
        return Err(UaError::service_fault("session", StatusCode::BAD_SESSION_ID_INVALID));
    };
    session.last_seen = Instant::now();
    Ok(session)
}

fn activated_session(inner: &mut Inner, header: &RequestHeader) -> UaResult<AuthenticationToken> {
    let session = touch_session(inner, header)?;
    if !session.activated {
        return Err(UaError::service_fault(
            "session",
            StatusCode::BAD_SESSION_NOT_ACTIVATED,
        ));
    }
    header
        .authentication_token
        .ok_or_else(|| UaError::service_fault("session", StatusCode::BAD_SESSION_ID_INVALID))
}

fn next_message(inner: &mut Inner, token: AuthenticationToken) -> Option<UaResult<ServiceResponse>> {
    let now = Instant::now();
    if let Some(session) = inner.sessions.get_mut(&token) {
        session.last_seen = now;
    }

    let retention = inner.retention;
    let mut owned = inner
        .subscriptions
        .iter_mut()
        .filter(|(_, s)| s.session == Some(token))
        .peekable();
    if owned.peek().is_none() {
        return Some(Err(UaError::service_fault(
            "Publish",
            StatusCode::BAD_NO_SUBSCRIPTION,
        )));
    }

    let mut keep_alive = None;
    for (id, subscription) in owned {
        subscription.last_publish = now;
        if let Some(changes) = subscription.queue.pop_front() {
            let sequence_number = subscription.take_sequence_number();
            let message = NotificationMessage {
                sequence_number,
                publish_time: Utc::now(),
                data_changes: changes,
            };
            retain(subscription, retention, message.clone());
            subscription.last_message = now;
            return Some(Ok(publish_response(*id, subscription, message)));
        }
        if keep_alive.is_none() && now.duration_since(subscription.last_message) >= subscription.keepalive {
            keep_alive = Some(*id);
        }
    }

    let id = keep_alive?;
    let subscription = inner.subscriptions.get_mut(&id)?;
    subscription.last_message = now;
    let message = NotificationMessage::keep_alive(subscription.next_sequence_number);
    Some(Ok(publish_response(id, subscription, message)))
}

fn publish_response(id: u32, subscription: &SimSubscription, message: NotificationMessage) -> ServiceResponse {
    ServiceResponse::Publish(PublishResponse {
        subscription_id: id,
        available_sequence_numbers: subscription.retransmission.keys().copied().collect(),
        more_notifications: !subscription.queue.is_empty(),
        notification_message: message,
        results: Vec::new(),
    })
}

// =============================================================================
// Simulated transport
// =============================================================================

struct SimTransport {
    server: Arc<SimServer>,
}

#[async_trait]
impl UaTransport for SimTransport {
    async fn connect(
        &self,
        endpoint: &EndpointUrl,
        hello: &HelloParameters,
    ) -> UaResult<Arc<dyn TransportConnection>> {
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.server.inner.lock();
        if !inner.online {
            return Err(UaError::refused(endpoint.as_str()));
        }
        debug_assert_eq!(hello.endpoint_url, endpoint.to_string());

        inner.next_link += 1;
        let id = inner.next_link;
        let (events, receiver) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        inner.links.push(Link {
            id,
            closed: closed.clone(),
            events,
        });

        Ok(Arc::new(SimConnection {
            server: Arc::clone(&self.server),
            id,
            protocol_version: inner.protocol_version,
            closed,
            receiver: Mutex::new(Some(receiver)),
        }))
    }

    fn name(&self) -> &str {
        "sim"
    }
}

struct SimConnection {
    server: Arc<SimServer>,
    id: u64,
    protocol_version: u32,
    closed: CancellationToken,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl SimConnection {
    fn ensure_open(&self) -> UaResult<()> {
        if self.closed.is_cancelled() {
            Err(UaError::closed("connection closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportConnection for SimConnection {
    fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    async fn open_secure_channel(&self, request: OpenSecureChannelRequest) -> UaResult<SecureChannelToken> {
        self.ensure_open()?;
        let mut inner = self.server.inner.lock();
        let service = match request.request_type {
            SecurityTokenRequestType::Issue => "OpenSecureChannel",
            SecurityTokenRequestType::Renew => "RenewSecureChannel",
        };
        *inner.calls.entry(service).or_default() += 1;
        inner.next_channel_id += 1;
        Ok(SecureChannelToken {
            channel_id: inner.next_channel_id,
            token_id: 1,
            revised_lifetime: request.requested_lifetime,
        })
    }

    async fn send(&self, header: RequestHeader, request: ServiceRequest) -> UaResult<ServiceResponse> {
        self.ensure_open()?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(UaError::closed("connection closed")),
            response = self.server.handle(header, request) => response,
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.receiver.lock().take()
    }

    async fn close(&self) {
        self.closed.cancel();
        self.server.inner.lock().links.retain(|link| link.id != self.id);
    }
}
