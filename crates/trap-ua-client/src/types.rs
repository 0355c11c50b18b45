// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Protocol-level value types shared by the connection engine.
//!
//! - **EndpointUrl**: validated `scheme://host:port[/path]` server address
//! - **NodeId**: node identifiers used by monitored items
//! - **StatusCode**: the subset of OPC UA status codes recovery reasons about
//! - **SecurityMode/Policy**: opaque security settings passed to the channel
//! - **UserIdentity**: the identity presented on session activation

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{ConfigurationError, ConnectionError, UaError};

/// Default OPC UA TCP port.
pub const DEFAULT_PORT: u16 = 4840;

// =============================================================================
// EndpointUrl
// =============================================================================

/// A parsed and validated server endpoint.
///
/// # Examples
///
/// ```
/// use trap_ua_client::types::EndpointUrl;
///
/// let endpoint: EndpointUrl = "opc.tcp://plc-01:4840/UA/Server".parse().unwrap();
/// assert_eq!(endpoint.host(), "plc-01");
/// assert_eq!(endpoint.port(), 4840);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointUrl {
    raw: String,
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

impl EndpointUrl {
    /// Supported URL schemes.
    pub const SCHEMES: [&'static str; 3] = ["opc.tcp", "opc.wss", "opc.https"];

    /// Parses an endpoint URL.
    ///
    /// Malformed URLs yield [`ConnectionError::InvalidEndpoint`].
    pub fn parse(input: &str) -> Result<Self, UaError> {
        let input = input.trim();
        let invalid = |reason: String| UaError::connection(ConnectionError::invalid_endpoint(input, reason));

        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;

        if !Self::SCHEMES.contains(&url.scheme()) {
            return Err(invalid(format!(
                "unsupported scheme '{}', expected one of {:?}",
                url.scheme(),
                Self::SCHEMES
            )));
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(invalid("missing host".to_string())),
        };

        let path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            raw: input.trim_end_matches('/').to_string(),
            scheme: url.scheme().to_string(),
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            path,
        })
    }

    /// Returns the URL as given, without a trailing slash.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port, defaulting to 4840.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the path, empty when absent.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns `true` if `advertised` names the same endpoint.
    ///
    /// Host names compare case-insensitively; an omitted port equals 4840.
    pub fn matches(&self, advertised: &str) -> bool {
        match Self::parse(advertised) {
            Ok(other) => {
                self.scheme == other.scheme
                    && self.host.eq_ignore_ascii_case(&other.host)
                    && self.port == other.port
                    && self.path == other.path
            }
            Err(_) => false,
        }
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for EndpointUrl {
    type Err = UaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// NodeId
// =============================================================================

/// OPC UA node identifier.
///
/// ```
/// use trap_ua_client::types::NodeId;
///
/// let node: NodeId = "ns=2;s=Boiler.Temperature".parse().unwrap();
/// assert_eq!(node, NodeId::string(2, "Boiler.Temperature"));
/// assert_eq!(node.to_string(), "ns=2;s=Boiler.Temperature");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index.
    pub namespace_index: u16,
    /// Identifier within the namespace.
    pub identifier: NodeIdentifier,
}

/// Identifier part of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
}

impl NodeId {
    /// Creates a numeric node ID.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node ID.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }

    /// Creates a GUID node ID.
    #[inline]
    pub fn guid(namespace_index: u16, value: Uuid) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Guid(value),
        }
    }

    /// `Server_ServerStatus_CurrentTime` (i=2258), used as the keep-alive probe.
    pub fn server_current_time() -> Self {
        Self::numeric(0, 2258)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_index != 0 {
            write!(f, "ns={};", self.namespace_index)?;
        }
        match &self.identifier {
            NodeIdentifier::Numeric(v) => write!(f, "i={v}"),
            NodeIdentifier::String(v) => write!(f, "s={v}"),
            NodeIdentifier::Guid(v) => write!(f, "g={v}"),
        }
    }
}

impl FromStr for NodeId {
    type Err = UaError;

    /// Parses `ns=2;i=1001`, `ns=2;s=Name`, `ns=2;g=<uuid>` or the same
    /// forms without the namespace prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: String| {
            UaError::configuration(ConfigurationError::invalid_value(
                "node_id",
                format!("'{s}': {reason}"),
            ))
        };

        let (namespace_index, identifier) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest
                    .split_once(';')
                    .ok_or_else(|| invalid("missing identifier after namespace".to_string()))?;
                let ns = ns
                    .parse::<u16>()
                    .map_err(|_| invalid("invalid namespace index".to_string()))?;
                (ns, id)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier.strip_prefix("i=") {
            NodeIdentifier::Numeric(
                id.parse()
                    .map_err(|_| invalid("invalid numeric identifier".to_string()))?,
            )
        } else if let Some(id) = identifier.strip_prefix("s=") {
            NodeIdentifier::String(id.to_string())
        } else if let Some(id) = identifier.strip_prefix("g=") {
            NodeIdentifier::Guid(Uuid::parse_str(id).map_err(|e| invalid(e.to_string()))?)
        } else {
            return Err(invalid("expected i=, s= or g=".to_string()));
        };

        Ok(Self {
            namespace_index,
            identifier,
        })
    }
}

// =============================================================================
// AttributeId
// =============================================================================

/// Node attribute watched by a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttributeId {
    /// NodeId attribute.
    NodeId,
    /// BrowseName attribute.
    BrowseName,
    /// DisplayName attribute.
    DisplayName,
    /// Value attribute.
    #[default]
    Value,
    /// EventNotifier attribute.
    EventNotifier,
}

impl AttributeId {
    /// Returns the numeric attribute id.
    pub const fn value(&self) -> u32 {
        match self {
            Self::NodeId => 1,
            Self::BrowseName => 3,
            Self::DisplayName => 4,
            Self::EventNotifier => 12,
            Self::Value => 13,
        }
    }
}

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Good.
    pub const GOOD: Self = Self(0x0000_0000);
    /// Request timed out.
    pub const BAD_TIMEOUT: Self = Self(0x800A_0000);
    /// Too many operations.
    pub const BAD_TOO_MANY_OPERATIONS: Self = Self(0x8010_0000);
    /// Secure channel closed.
    pub const BAD_SECURE_CHANNEL_CLOSED: Self = Self(0x8086_0000);
    /// Session id not valid.
    pub const BAD_SESSION_ID_INVALID: Self = Self(0x8025_0000);
    /// Session closed.
    pub const BAD_SESSION_CLOSED: Self = Self(0x8026_0000);
    /// Session not activated.
    pub const BAD_SESSION_NOT_ACTIVATED: Self = Self(0x8027_0000);
    /// Subscription id not valid.
    pub const BAD_SUBSCRIPTION_ID_INVALID: Self = Self(0x8028_0000);
    /// User access denied.
    pub const BAD_USER_ACCESS_DENIED: Self = Self(0x801F_0000);
    /// Identity token rejected.
    pub const BAD_IDENTITY_TOKEN_REJECTED: Self = Self(0x8021_0000);
    /// Too many subscriptions.
    pub const BAD_TOO_MANY_SUBSCRIPTIONS: Self = Self(0x8077_0000);
    /// No subscription.
    pub const BAD_NO_SUBSCRIPTION: Self = Self(0x8079_0000);
    /// Requested message not available.
    pub const BAD_MESSAGE_NOT_AVAILABLE: Self = Self(0x807B_0000);
    /// Sequence number unknown.
    pub const BAD_SEQUENCE_NUMBER_UNKNOWN: Self = Self(0x807A_0000);
    /// Protocol version unsupported.
    pub const BAD_PROTOCOL_VERSION_UNSUPPORTED: Self = Self(0x80BE_0000);
    /// Connection closed.
    pub const BAD_CONNECTION_CLOSED: Self = Self(0x80AE_0000);
    /// Not connected.
    pub const BAD_NOT_CONNECTED: Self = Self(0x808A_0000);
    /// Node id unknown.
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);

    /// Returns `true` for good status codes.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` for bad status codes.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Returns the symbolic name, or `None` for unlisted codes.
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::GOOD => "Good",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_TOO_MANY_OPERATIONS => "BadTooManyOperations",
            Self::BAD_SECURE_CHANNEL_CLOSED => "BadSecureChannelClosed",
            Self::BAD_SESSION_ID_INVALID => "BadSessionIdInvalid",
            Self::BAD_SESSION_CLOSED => "BadSessionClosed",
            Self::BAD_SESSION_NOT_ACTIVATED => "BadSessionNotActivated",
            Self::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            Self::BAD_USER_ACCESS_DENIED => "BadUserAccessDenied",
            Self::BAD_IDENTITY_TOKEN_REJECTED => "BadIdentityTokenRejected",
            Self::BAD_TOO_MANY_SUBSCRIPTIONS => "BadTooManySubscriptions",
            Self::BAD_NO_SUBSCRIPTION => "BadNoSubscription",
            Self::BAD_MESSAGE_NOT_AVAILABLE => "BadMessageNotAvailable",
            Self::BAD_SEQUENCE_NUMBER_UNKNOWN => "BadSequenceNumberUnknown",
            Self::BAD_PROTOCOL_VERSION_UNSUPPORTED => "BadProtocolVersionUnsupported",
            Self::BAD_CONNECTION_CLOSED => "BadConnectionClosed",
            Self::BAD_NOT_CONNECTED => "BadNotConnected",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

// =============================================================================
// SecurityMode
// =============================================================================

/// Message security mode requested for the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No security.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecurityMode {
    type Err = UaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(UaError::configuration(ConfigurationError::invalid_value(
                "security_mode",
                format!("unknown security mode '{s}'"),
            ))),
        }
    }
}

// =============================================================================
// SecurityPolicy
// =============================================================================

/// Security policy requested for the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security policy.
    #[default]
    None,
    /// Basic256Sha256.
    Basic256Sha256,
    /// Aes128_Sha256_RsaOaep.
    Aes128Sha256RsaOaep,
    /// Aes256_Sha256_RsaPss.
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    /// Returns the policy URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
            Self::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
            Self::Aes256Sha256RsaPss => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            }
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.uri().rsplit('#').next().unwrap_or_default();
        f.write_str(name)
    }
}

// =============================================================================
// UserIdentity
// =============================================================================

/// Identity presented when activating a session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserIdentity {
    /// Anonymous.
    #[default]
    Anonymous,
    /// User name and password.
    UserName {
        /// The user name.
        username: String,
        /// The password.
        password: String,
    },
}

impl UserIdentity {
    /// Returns the user name, or "anonymous".
    pub fn user(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::UserName { username, .. } => username,
        }
    }
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::UserName { username, .. } => f
                .debug_struct("UserName")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
