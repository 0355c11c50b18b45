// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Transport abstraction.
//!
//! Message encoding and the cryptographic part of the secure-channel
//! handshake live behind [`UaTransport`] and [`TransportConnection`]. The
//! connection engine only needs to open a connection, open or renew a
//! secure channel over it, exchange the handful of services recovery relies
//! on, and learn when the connection dies.
//!
//! Service faults are reported as `Err(UaError::Service(..))` carrying the
//! status code; transport failures as connection or timeout errors.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::UaResult;
use crate::subscription::{MonitoredItem, SubscriptionParameters};
use crate::types::{AttributeId, EndpointUrl, NodeId, SecurityMode, SecurityPolicy, StatusCode, UserIdentity};

/// OPC UA TCP protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 0;

// =============================================================================
// Transport traits
// =============================================================================

/// Opens connections to a server.
#[async_trait]
pub trait UaTransport: Send + Sync + 'static {
    /// Connects to `endpoint` and completes the Hello/Acknowledge exchange.
    ///
    /// Exactly one attempt; no internal retry.
    async fn connect(
        &self,
        endpoint: &EndpointUrl,
        hello: &HelloParameters,
    ) -> UaResult<Arc<dyn TransportConnection>>;

    /// Returns a display name for logging.
    fn name(&self) -> &str {
        "opc.tcp"
    }
}

/// One live connection to a server.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Protocol version announced by the server in its Acknowledge.
    fn protocol_version(&self) -> u32;

    /// Issues or renews the secure channel token.
    async fn open_secure_channel(
        &self,
        request: OpenSecureChannelRequest,
    ) -> UaResult<SecureChannelToken>;

    /// Sends one service request and waits for its response.
    async fn send(&self, header: RequestHeader, request: ServiceRequest)
        -> UaResult<ServiceResponse>;

    /// Takes the close/error event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Closes the connection. Must not produce a [`TransportEvent`].
    async fn close(&self);
}

/// Unsolicited transport notifications.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The peer closed the connection.
    Closed {
        /// Reason, if known.
        reason: Option<String>,
    },
    /// The connection failed.
    Error {
        /// Description of the failure.
        message: String,
    },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { reason: Some(reason) } => write!(f, "closed: {reason}"),
            Self::Closed { reason: None } => f.write_str("closed"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

// =============================================================================
// Connection and channel parameters
// =============================================================================

/// Parameters of the Hello message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloParameters {
    /// Protocol version requested by the client.
    pub protocol_version: u32,
    /// Receive buffer size.
    pub receive_buffer_size: u32,
    /// Send buffer size.
    pub send_buffer_size: u32,
    /// Maximum message size, 0 for no limit.
    pub max_message_size: u32,
    /// Endpoint URL as sent to the server.
    pub endpoint_url: String,
}

impl HelloParameters {
    /// Creates Hello parameters for `endpoint` with default buffer sizes.
    pub fn new(endpoint: &EndpointUrl) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: 65_535,
            send_buffer_size: 65_535,
            max_message_size: 0,
            endpoint_url: endpoint.to_string(),
        }
    }
}

/// Whether a token is issued or renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityTokenRequestType {
    /// New channel.
    Issue,
    /// Renewal of an existing channel.
    Renew,
}

/// OpenSecureChannel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSecureChannelRequest {
    /// Issue or renew.
    pub request_type: SecurityTokenRequestType,
    /// Message security mode.
    pub security_mode: SecurityMode,
    /// Security policy.
    pub security_policy: SecurityPolicy,
    /// Requested token lifetime.
    pub requested_lifetime: Duration,
}

/// Secure channel token granted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureChannelToken {
    /// Channel id.
    pub channel_id: u32,
    /// Token id.
    pub token_id: u32,
    /// Lifetime granted by the server.
    pub revised_lifetime: Duration,
}

// =============================================================================
// Request header
// =============================================================================

/// Opaque token identifying an activated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthenticationToken(pub Uuid);

impl AuthenticationToken {
    /// Creates a random token.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AuthenticationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are secrets; only a prefix is ever printed.
        let text = self.0.simple().to_string();
        write!(f, "{}…", &text[..8])
    }
}

/// Header sent with every service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Session token, absent before CreateSession.
    pub authentication_token: Option<AuthenticationToken>,
    /// Client-assigned request handle.
    pub request_handle: u32,
    /// Timeout hint for the server.
    pub timeout_hint: Duration,
}

// =============================================================================
// Service requests
// =============================================================================

/// Services the connection engine issues.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    /// GetEndpoints.
    GetEndpoints {
        /// URL used to reach the server.
        endpoint_url: String,
    },
    /// CreateSession.
    CreateSession {
        /// Application name.
        application_name: String,
        /// Session name.
        session_name: String,
        /// Endpoint URL.
        endpoint_url: String,
        /// Requested session timeout.
        requested_timeout: Duration,
    },
    /// ActivateSession.
    ActivateSession {
        /// Identity to activate with.
        identity: UserIdentity,
    },
    /// CloseSession.
    CloseSession {
        /// Also delete the session's subscriptions.
        delete_subscriptions: bool,
    },
    /// Read of a single attribute.
    Read {
        /// Node to read.
        node_id: NodeId,
        /// Attribute to read.
        attribute_id: AttributeId,
    },
    /// CreateSubscription.
    CreateSubscription {
        /// Requested parameters.
        parameters: SubscriptionParameters,
    },
    /// CreateMonitoredItems.
    CreateMonitoredItems {
        /// Server subscription id.
        subscription_id: u32,
        /// Items to create.
        items: Vec<MonitoredItem>,
    },
    /// DeleteSubscriptions.
    DeleteSubscriptions {
        /// Server subscription ids.
        subscription_ids: Vec<u32>,
    },
    /// Publish.
    Publish {
        /// Sequence numbers consumed since the last Publish.
        acknowledgements: Vec<SubscriptionAcknowledgement>,
    },
    /// Republish.
    Republish {
        /// Server subscription id.
        subscription_id: u32,
        /// Sequence number to retransmit.
        retransmit_sequence_number: u32,
    },
    /// TransferSubscriptions.
    TransferSubscriptions {
        /// Server subscription ids.
        subscription_ids: Vec<u32>,
        /// Ask for current values of all items after the transfer.
        send_initial_values: bool,
    },
}

impl ServiceRequest {
    /// Returns the service name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetEndpoints { .. } => "GetEndpoints",
            Self::CreateSession { .. } => "CreateSession",
            Self::ActivateSession { .. } => "ActivateSession",
            Self::CloseSession { .. } => "CloseSession",
            Self::Read { .. } => "Read",
            Self::CreateSubscription { .. } => "CreateSubscription",
            Self::CreateMonitoredItems { .. } => "CreateMonitoredItems",
            Self::DeleteSubscriptions { .. } => "DeleteSubscriptions",
            Self::Publish { .. } => "Publish",
            Self::Republish { .. } => "Republish",
            Self::TransferSubscriptions { .. } => "TransferSubscriptions",
        }
    }
}

/// Acknowledgement of a consumed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionAcknowledgement {
    /// Server subscription id.
    pub subscription_id: u32,
    /// Consumed sequence number.
    pub sequence_number: u32,
}

// =============================================================================
// Service responses
// =============================================================================

/// Responses to [`ServiceRequest`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResponse {
    /// GetEndpoints response.
    GetEndpoints {
        /// Endpoints advertised by the server.
        endpoints: Vec<EndpointDescription>,
    },
    /// CreateSession response.
    CreateSession {
        /// Session id.
        session_id: NodeId,
        /// Authentication token.
        authentication_token: AuthenticationToken,
        /// Timeout granted by the server.
        revised_timeout: Duration,
    },
    /// ActivateSession response.
    ActivateSession,
    /// CloseSession response.
    CloseSession,
    /// Read response.
    Read {
        /// Value read.
        value: DataValue,
    },
    /// CreateSubscription response.
    CreateSubscription {
        /// Server subscription id.
        subscription_id: u32,
        /// Revised publishing interval.
        revised_publishing_interval: Duration,
        /// Revised lifetime count.
        revised_lifetime_count: u32,
        /// Revised keep-alive count.
        revised_max_keepalive_count: u32,
    },
    /// CreateMonitoredItems response, one result per requested item.
    CreateMonitoredItems {
        /// Per-item results.
        results: Vec<MonitoredItemCreateResult>,
    },
    /// DeleteSubscriptions response.
    DeleteSubscriptions {
        /// Per-subscription status.
        results: Vec<StatusCode>,
    },
    /// Publish response.
    Publish(PublishResponse),
    /// Republish response.
    Republish {
        /// The retransmitted message.
        notification_message: NotificationMessage,
    },
    /// TransferSubscriptions response.
    TransferSubscriptions {
        /// Per-subscription results.
        results: Vec<TransferResult>,
    },
}

/// Endpoint advertised in GetEndpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescription {
    /// Endpoint URL.
    pub endpoint_url: String,
    /// Security mode.
    pub security_mode: SecurityMode,
    /// Security policy.
    pub security_policy: SecurityPolicy,
}

/// Result of creating one monitored item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitoredItemCreateResult {
    /// Status.
    pub status: StatusCode,
    /// Server-assigned item id.
    pub monitored_item_id: u32,
    /// Revised sampling interval.
    pub revised_sampling_interval: Duration,
    /// Revised queue size.
    pub revised_queue_size: u32,
}

/// Result of transferring one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Status.
    pub status: StatusCode,
    /// Sequence numbers still available for Republish.
    pub available_sequence_numbers: Vec<u32>,
}

/// Publish response.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishResponse {
    /// Subscription the message belongs to.
    pub subscription_id: u32,
    /// Sequence numbers available for Republish.
    pub available_sequence_numbers: Vec<u32>,
    /// More notifications are queued.
    pub more_notifications: bool,
    /// The message. Keep-alives carry no data.
    pub notification_message: NotificationMessage,
    /// Results of the acknowledgements.
    pub results: Vec<StatusCode>,
}

/// A numbered batch of notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    /// Sequence number. For keep-alives, the next number to be used.
    pub sequence_number: u32,
    /// Publish time.
    pub publish_time: DateTime<Utc>,
    /// Data changes.
    pub data_changes: Vec<MonitoredItemNotification>,
}

impl NotificationMessage {
    /// Creates a keep-alive message announcing `next_sequence_number`.
    pub fn keep_alive(next_sequence_number: u32) -> Self {
        Self {
            sequence_number: next_sequence_number,
            publish_time: Utc::now(),
            data_changes: Vec::new(),
        }
    }

    /// Returns `true` for keep-alive messages.
    #[inline]
    pub fn is_keep_alive(&self) -> bool {
        self.data_changes.is_empty()
    }
}

/// One data change.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemNotification {
    /// Client handle of the monitored item.
    pub client_handle: u32,
    /// New value.
    pub value: DataValue,
}

// =============================================================================
// DataValue / Variant
// =============================================================================

/// A value with status and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    /// The value.
    pub value: Variant,
    /// Quality.
    pub status: StatusCode,
    /// Source timestamp.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Creates a good value stamped now.
    pub fn new(value: impl Into<Variant>) -> Self {
        let now = Utc::now();
        Self {
            value: value.into(),
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }
}

/// Value payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    /// No value.
    #[default]
    Null,
    /// Boolean.
    Boolean(bool),
    /// Signed integer.
    Int64(i64),
    /// Floating point.
    Double(f64),
    /// String.
    String(String),
    /// Date/time.
    DateTime(DateTime<Utc>),
}

impl Variant {
    /// Returns the value as an i64 when numeric.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Boolean(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            Self::Double(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Returns the value as an f64 when numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for Variant {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
