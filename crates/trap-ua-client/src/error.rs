// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the OPC UA client connection engine.
//!
//! Errors are grouped by the layer that produced them, while
//! [`UaError::kind`] folds every concrete error onto the small taxonomy the
//! reconnection logic reasons about:
//!
//! ```text
//! UaError
//! ├── Connection    - transport, endpoint and retry-policy outcomes
//! ├── Session       - session lifecycle errors
//! ├── Security      - authentication and channel security errors
//! ├── Subscription  - subscription loss and notification gaps
//! ├── Service       - service faults carrying an OPC UA status code
//! ├── Configuration - invalid settings
//! └── Timeout       - request deadlines
//! ```
//!
//! # Examples
//!
//! ```
//! use trap_ua_client::error::{ConnectionError, ErrorKind, UaError};
//!
//! let error = UaError::connection(ConnectionError::refused("opc.tcp://localhost:4840"));
//! assert_eq!(error.kind(), ErrorKind::NetworkFailure);
//! assert!(error.is_retryable());
//! ```

use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

use crate::types::StatusCode;

// =============================================================================
// ErrorKind
// =============================================================================

/// The failure taxonomy used by the reconnection and recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect refused, reset, closed or timed out.
    NetworkFailure,
    /// Client and server disagree on the protocol version.
    ProtocolIncompatible,
    /// Credentials or identity token rejected.
    AuthenticationFailure,
    /// The server no longer knows the session.
    SessionExpired,
    /// The server dropped a subscription.
    SubscriptionLost,
    /// Notifications the server can no longer supply.
    NotificationGap,
    /// The connection strategy ran out of attempts.
    RetriesExhausted,
    /// `disconnect()` interrupted the operation.
    UserCancelled,
    /// A service returned a bad status not covered above.
    ServiceFault,
    /// Invalid configuration.
    Configuration,
    /// The call is not allowed in the current connection state.
    InvalidState,
}

impl ErrorKind {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkFailure => "network_failure",
            Self::ProtocolIncompatible => "protocol_incompatible",
            Self::AuthenticationFailure => "authentication_failure",
            Self::SessionExpired => "session_expired",
            Self::SubscriptionLost => "subscription_lost",
            Self::NotificationGap => "notification_gap",
            Self::RetriesExhausted => "retries_exhausted",
            Self::UserCancelled => "user_cancelled",
            Self::ServiceFault => "service_fault",
            Self::Configuration => "configuration",
            Self::InvalidState => "invalid_state",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// UaError - Main Error Type
// =============================================================================

/// The main error type of the client.
#[derive(Debug, Clone, Error)]
pub enum UaError {
    /// Connection-related errors.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Session lifecycle errors.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Security and authentication errors.
    #[error("{0}")]
    Security(#[from] SecurityError),

    /// Subscription errors.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Service faults.
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Configuration errors.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Timeout errors.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),
}

impl UaError {
    // =========================================================================
    // Factory Methods
    // =========================================================================

    /// Creates a connection error.
    #[inline]
    pub fn connection(error: ConnectionError) -> Self {
        Self::Connection(error)
    }

    /// Creates a session error.
    #[inline]
    pub fn session(error: SessionError) -> Self {
        Self::Session(error)
    }

    /// Creates a security error.
    #[inline]
    pub fn security(error: SecurityError) -> Self {
        Self::Security(error)
    }

    /// Creates a subscription error.
    #[inline]
    pub fn subscription(error: SubscriptionError) -> Self {
        Self::Subscription(error)
    }

    /// Creates a configuration error.
    #[inline]
    pub fn configuration(error: ConfigurationError) -> Self {
        Self::Configuration(error)
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(error: TimeoutError) -> Self {
        Self::Timeout(error)
    }

    // =========================================================================
    // Convenience Factory Methods
    // =========================================================================

    /// Creates a connection refused error.
    pub fn refused(endpoint: impl Into<String>) -> Self {
        Self::Connection(ConnectionError::refused(endpoint))
    }

    /// Creates a connection closed error.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Connection(ConnectionError::closed(Some(reason.into())))
    }

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::Connection(ConnectionError::NotConnected)
    }

    /// Creates a cancelled error.
    pub fn cancelled() -> Self {
        Self::Connection(ConnectionError::Cancelled)
    }

    /// Creates an invalid state error.
    pub fn invalid_state(operation: &'static str, state: impl Into<String>) -> Self {
        Self::Connection(ConnectionError::InvalidState {
            operation,
            state: state.into(),
        })
    }

    /// Creates a retries exhausted error wrapping the last failure.
    pub fn retries_exhausted(attempts: u32, last: UaError) -> Self {
        Self::Connection(ConnectionError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    /// Creates a service fault.
    pub fn service_fault(service: &'static str, status: StatusCode) -> Self {
        Self::Service(ServiceError::Fault { service, status })
    }

    /// Creates a request timeout.
    pub fn request_timeout(service: &'static str, duration: Duration) -> Self {
        Self::Timeout(TimeoutError::Request { service, duration })
    }

    /// Creates an identity rejected error.
    pub fn identity_rejected(user: impl Into<String>, status: StatusCode) -> Self {
        Self::Security(SecurityError::IdentityTokenRejected {
            user: user.into(),
            status,
        })
    }

    /// Creates a notification gap error.
    pub fn notification_gap(subscription_id: u32, missing: RangeInclusive<u32>) -> Self {
        Self::Subscription(SubscriptionError::NotificationGap {
            subscription_id,
            missing,
        })
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Maps this error onto the reconnection taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Security(_) => ErrorKind::AuthenticationFailure,
            Self::Subscription(e) => e.kind(),
            Self::Service(e) => e.kind(),
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Timeout(_) => ErrorKind::NetworkFailure,
        }
    }

    /// Returns `true` if the connection strategy may retry after this error.
    ///
    /// Protocol and authentication failures count as ordinary failed
    /// attempts; the strategy bounds how many are made.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::NetworkFailure
            | ErrorKind::ProtocolIncompatible
            | ErrorKind::AuthenticationFailure
            | ErrorKind::SessionExpired
            | ErrorKind::ServiceFault => !self.is_endpoint_error(),
            _ => false,
        }
    }

    /// Returns `true` if the failure is a connection-level (network) error
    /// that should tear down the current channel.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::NetworkFailure) && !self.is_endpoint_error()
    }

    fn is_endpoint_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::InvalidEndpoint { .. })
        )
    }

    /// Returns the status code when this error is a service fault.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Service(ServiceError::Fault { status, .. })
            | Self::Security(SecurityError::IdentityTokenRejected { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Returns the last underlying failure for [`ConnectionError::RetriesExhausted`],
    /// or `self` otherwise.
    pub fn last_error(&self) -> &UaError {
        match self {
            Self::Connection(ConnectionError::RetriesExhausted { last, .. }) => last.last_error(),
            other => other,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Connection(e) => e.severity(),
            Self::Session(_) => ErrorSeverity::Warning,
            Self::Security(_) => ErrorSeverity::Error,
            Self::Subscription(e) => e.severity(),
            Self::Service(_) => ErrorSeverity::Warning,
            Self::Configuration(_) => ErrorSeverity::Critical,
            Self::Timeout(_) => ErrorSeverity::Warning,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Session(_) => "session",
            Self::Security(_) => "security",
            Self::Subscription(_) => "subscription",
            Self::Service(_) => "service",
            Self::Configuration(_) => "configuration",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Security(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Service(_) => ErrorCode::new(5, 1),
            Self::Configuration(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
        }
    }

    /// Returns a short recovery hint for operators.
    pub fn recovery_hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NetworkFailure => "Check that the server is running and reachable",
            ErrorKind::ProtocolIncompatible => "Upgrade the client or server protocol stack",
            ErrorKind::AuthenticationFailure => "Verify the configured user identity",
            ErrorKind::SessionExpired => "A new session will be created automatically",
            ErrorKind::SubscriptionLost => "The subscription will be recreated automatically",
            ErrorKind::NotificationGap => "Values produced in the missing range are lost",
            ErrorKind::RetriesExhausted => "Increase max_retry or call connect() again",
            ErrorKind::UserCancelled => "The operation was cancelled by disconnect()",
            ErrorKind::ServiceFault => "Check the server diagnostics for the status code",
            ErrorKind::Configuration => "Fix the client configuration",
            ErrorKind::InvalidState => "Wait for the current connection operation to finish",
        }
    }

    /// Returns the tracing level for this error.
    pub fn tracing_level(&self) -> Level {
        self.severity().to_tracing_level()
    }

    /// Logs this error with appropriate level and context.
    pub fn log(&self, context: &str) {
        let code = self.error_code();
        let kind = self.kind();

        match self.tracing_level() {
            Level::ERROR => tracing::error!(
                error_code = %code,
                kind = %kind,
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                kind = %kind,
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                kind = %kind,
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
        }
    }
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Connection-related errors.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Connection refused.
    #[error("Connection refused to '{endpoint}'")]
    Refused {
        /// Target endpoint.
        endpoint: String,
    },

    /// Connection attempt timed out.
    #[error("Connection timed out to '{endpoint}' after {duration:?}")]
    TimedOut {
        /// Target endpoint.
        endpoint: String,
        /// Timeout duration.
        duration: Duration,
    },

    /// The endpoint URL is not advertised by the server.
    #[error("Endpoint not advertised by server: '{endpoint}'")]
    EndpointNotFound {
        /// The endpoint URL.
        endpoint: String,
    },

    /// Malformed endpoint URL.
    #[error("Invalid endpoint URL: '{url}' - {reason}")]
    InvalidEndpoint {
        /// The invalid URL.
        url: String,
        /// Reason.
        reason: String,
    },

    /// Hello/Acknowledge negotiated an unsupported protocol version.
    #[error("Protocol version mismatch: client {client}, server {server}")]
    ProtocolVersionMismatch {
        /// Version spoken by the client.
        client: u32,
        /// Version reported by the server.
        server: u32,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Closed {
        /// Reason for closure.
        reason: Option<String>,
    },

    /// Not connected.
    #[error("Not connected to OPC UA server")]
    NotConnected,

    /// Operation not allowed in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Connection state at the time of the call.
        state: String,
    },

    /// The connection strategy gave up.
    #[error("Connection retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last underlying failure.
        last: Box<UaError>,
    },

    /// Cancelled by `disconnect()`.
    #[error("Connection cancelled by disconnect")]
    Cancelled,
}

impl ConnectionError {
    /// Creates a connection refused error.
    pub fn refused(endpoint: impl Into<String>) -> Self {
        Self::Refused {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a connection timed out error.
    pub fn timed_out(endpoint: impl Into<String>, duration: Duration) -> Self {
        Self::TimedOut {
            endpoint: endpoint.into(),
            duration,
        }
    }

    /// Creates an endpoint not found error.
    pub fn endpoint_not_found(endpoint: impl Into<String>) -> Self {
        Self::EndpointNotFound {
            endpoint: endpoint.into(),
        }
    }

    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a connection closed error.
    pub fn closed(reason: Option<String>) -> Self {
        Self::Closed { reason }
    }

    /// Maps onto the reconnection taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolVersionMismatch { .. } => ErrorKind::ProtocolIncompatible,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::Cancelled => ErrorKind::UserCancelled,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            _ => ErrorKind::NetworkFailure,
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled => ErrorSeverity::Info,
            Self::NotConnected | Self::TimedOut { .. } | Self::Closed { .. } => {
                ErrorSeverity::Warning
            }
            Self::ProtocolVersionMismatch { .. } => ErrorSeverity::Warning,
            Self::InvalidState { .. } => ErrorSeverity::Warning,
            Self::RetriesExhausted { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Refused { .. } => ErrorCode::new(1, 1),
            Self::TimedOut { .. } => ErrorCode::new(1, 2),
            Self::EndpointNotFound { .. } => ErrorCode::new(1, 3),
            Self::InvalidEndpoint { .. } => ErrorCode::new(1, 4),
            Self::ProtocolVersionMismatch { .. } => ErrorCode::new(1, 5),
            Self::Closed { .. } => ErrorCode::new(1, 6),
            Self::NotConnected => ErrorCode::new(1, 7),
            Self::InvalidState { .. } => ErrorCode::new(1, 8),
            Self::RetriesExhausted { .. } => ErrorCode::new(1, 9),
            Self::Cancelled => ErrorCode::new(1, 10),
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Session lifecycle errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// No active session.
    #[error("Session not activated")]
    NotActivated,
}

impl SessionError {
    /// Maps onto the reconnection taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotActivated => ErrorKind::SessionExpired,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotActivated => ErrorCode::new(2, 1),
        }
    }
}

// =============================================================================
// SecurityError
// =============================================================================

/// Security and authentication errors.
#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    /// User identity token rejected by the server.
    #[error("Identity token rejected for user '{user}': {status}")]
    IdentityTokenRejected {
        /// User name, or "anonymous".
        user: String,
        /// Status returned by ActivateSession.
        status: StatusCode,
    },
}

impl SecurityError {
    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::IdentityTokenRejected { .. } => ErrorCode::new(3, 1),
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription errors.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// Subscription not known to the client.
    #[error("Subscription not found: {handle}")]
    NotFound {
        /// Client handle of the subscription.
        handle: u32,
    },

    /// The server dropped the subscription.
    #[error("Subscription {subscription_id} lost on server")]
    Lost {
        /// Server subscription ID.
        subscription_id: u32,
    },

    /// Notifications the server can no longer supply.
    #[error("Notification gap on subscription {subscription_id}: sequence numbers {missing:?} lost")]
    NotificationGap {
        /// Server subscription ID.
        subscription_id: u32,
        /// Missing sequence numbers.
        missing: RangeInclusive<u32>,
    },

    /// Monitored item creation failed.
    #[error("Monitored item '{node_id}' rejected: {status}")]
    MonitoredItemRejected {
        /// Node of the rejected item.
        node_id: String,
        /// Status returned by the server.
        status: StatusCode,
    },

    /// Invalid subscription parameters.
    #[error("Invalid subscription parameters: {message}")]
    InvalidParameters {
        /// Error message.
        message: String,
    },
}

impl SubscriptionError {
    /// Maps onto the reconnection taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Lost { .. } => ErrorKind::SubscriptionLost,
            Self::NotificationGap { .. } => ErrorKind::NotificationGap,
            Self::InvalidParameters { .. } => ErrorKind::Configuration,
            Self::NotFound { .. } | Self::MonitoredItemRejected { .. } => ErrorKind::ServiceFault,
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Lost { .. } | Self::NotificationGap { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::new(4, 1),
            Self::Lost { .. } => ErrorCode::new(4, 2),
            Self::NotificationGap { .. } => ErrorCode::new(4, 3),
            Self::MonitoredItemRejected { .. } => ErrorCode::new(4, 4),
            Self::InvalidParameters { .. } => ErrorCode::new(4, 5),
        }
    }
}

// =============================================================================
// ServiceError
// =============================================================================

/// Faults returned by individual service calls.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The service answered with a bad status code.
    #[error("{service} failed: {status}")]
    Fault {
        /// Service name.
        service: &'static str,
        /// Returned status.
        status: StatusCode,
    },

    /// The response did not match the request.
    #[error("Unexpected response to {service}")]
    UnexpectedResponse {
        /// Service name.
        service: &'static str,
    },
}

impl ServiceError {
    /// Maps onto the reconnection taxonomy by status code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fault { status, .. } => match *status {
                StatusCode::BAD_SESSION_ID_INVALID
                | StatusCode::BAD_SESSION_CLOSED
                | StatusCode::BAD_SESSION_NOT_ACTIVATED => ErrorKind::SessionExpired,
                StatusCode::BAD_SUBSCRIPTION_ID_INVALID => ErrorKind::SubscriptionLost,
                StatusCode::BAD_USER_ACCESS_DENIED | StatusCode::BAD_IDENTITY_TOKEN_REJECTED => {
                    ErrorKind::AuthenticationFailure
                }
                StatusCode::BAD_PROTOCOL_VERSION_UNSUPPORTED => ErrorKind::ProtocolIncompatible,
                StatusCode::BAD_TIMEOUT
                | StatusCode::BAD_SECURE_CHANNEL_CLOSED
                | StatusCode::BAD_CONNECTION_CLOSED
                | StatusCode::BAD_NOT_CONNECTED => ErrorKind::NetworkFailure,
                _ => ErrorKind::ServiceFault,
            },
            Self::UnexpectedResponse { .. } => ErrorKind::ServiceFault,
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    /// A field holds an invalid value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Reason.
        reason: String,
    },

    /// The configuration source could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },

    /// Unsupported configuration file format.
    #[error("Unsupported configuration format: {extension}")]
    UnsupportedFormat {
        /// File extension.
        extension: String,
    },

    /// The configuration file could not be read.
    #[error("Failed to read configuration file '{path}': {message}")]
    Io {
        /// File path.
        path: String,
        /// I/O error message.
        message: String,
    },
}

impl ConfigurationError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidValue { .. } => ErrorCode::new(6, 1),
            Self::Parse { .. } => ErrorCode::new(6, 2),
            Self::UnsupportedFormat { .. } => ErrorCode::new(6, 3),
            Self::Io { .. } => ErrorCode::new(6, 4),
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// Timeout errors. All of them count as network failures.
#[derive(Debug, Clone, Error)]
pub enum TimeoutError {
    /// A service request timed out.
    #[error("{service} request timed out after {duration:?}")]
    Request {
        /// Service name.
        service: &'static str,
        /// Timeout duration.
        duration: Duration,
    },

    /// Keep-alive probe unanswered.
    #[error("Keep-alive timed out after {0:?}")]
    KeepAlive(Duration),
}

impl TimeoutError {
    /// Returns the timeout duration.
    pub fn duration(&self) -> Duration {
        match self {
            Self::KeepAlive(d) => *d,
            Self::Request { duration, .. } => *duration,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Request { .. } => ErrorCode::new(7, 1),
            Self::KeepAlive(_) => ErrorCode::new(7, 2),
        }
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action required.
    Info,
    /// Warning - action may be required.
    Warning,
    /// Error - action required, but recoverable.
    Error,
    /// Critical - immediate action required.
    Critical,
}

impl ErrorSeverity {
    /// Converts to tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code.
///
/// Format: `UA-XXYY` where XX is category and YY is specific error.
///
/// Categories: 1 connection, 2 session, 3 security, 4 subscription,
/// 5 service, 6 configuration, 7 timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category.
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }

    /// Returns the full error code as a u16.
    pub fn as_u16(&self) -> u16 {
        ((self.category as u16) << 8) | (self.code as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A Result type with [`UaError`].
pub type UaResult<T> = Result<T, UaError>;

// =============================================================================
// Tests
// =============================================================================
