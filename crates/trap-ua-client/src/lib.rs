// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Resilient OPC UA client connections for the TRAP gateway.
//!
//! This crate keeps an OPC UA client usable across network outages, server
//! restarts and session expiry. It owns the connection lifecycle only: the
//! byte-level transport is supplied by the application through the
//! [`UaTransport`] trait.
//!
//! # Features
//!
//! - Exponential backoff with jitter and a bounded or unbounded retry budget
//! - Secure channel management with loss detection and token renewal
//! - Session re-activation after short outages, recreation after long ones
//! - Subscription recovery through Republish, TransferSubscriptions or
//!   recreation, with exactly-once in-order notification delivery
//! - Lifecycle events: `backoff`, `start_reconnection`,
//!   `connection_reestablished`, `after_reconnection`, `close`
//!
//! # Error Handling
//!
//! ```text
//! UaError
//! ├── Connection    - Refused, timed out, closed, retries exhausted, cancelled
//! ├── Session       - Creation, activation and expiry
//! ├── Security      - Authentication and protocol version
//! ├── Subscription  - Lost subscriptions, notification gaps, rejected items
//! ├── Service       - Bad status codes from the server
//! ├── Configuration - Invalid settings
//! └── Timeout       - Connect and request timeouts
//! ```
//!
//! Every error maps onto an [`ErrorKind`] which drives the retry policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use trap_ua_client::{ClientConfig, MonitoredItem, NodeId, SubscriptionParameters, UaClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .endpoint("opc.tcp://localhost:4840")
//!         .build()?;
//!
//!     let client = UaClient::new(config, transport)?;
//!     client.connect().await?;
//!
//!     let mut stream = client.create_subscription(SubscriptionParameters::default()).await?;
//!     client
//!         .add_monitored_items(stream.handle(), vec![MonitoredItem::new(NodeId::string(2, "Temperature"))])
//!         .await?;
//!
//!     while let Some(notification) = stream.recv().await {
//!         println!("{notification:?}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod recovery;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use error::{
    ConfigurationError, ConnectionError, ErrorCode, ErrorKind, ErrorSeverity, SecurityError,
    ServiceError, SessionError, SubscriptionError, TimeoutError, UaError, UaResult,
};

pub use types::{
    AttributeId, EndpointUrl, NodeId, NodeIdentifier, SecurityMode, SecurityPolicy, StatusCode,
    UserIdentity,
};

pub use config::{ClientConfig, ClientConfigBuilder, ConfigFormat, SubscriptionDefaults};

pub use backoff::{
    BackoffCanceller, BackoffOutcome, BackoffScheduler, BackoffStep, ConnectionStrategy, MaxRetry,
};

pub use transport::{
    DataValue, NotificationMessage, ServiceRequest, ServiceResponse, TransportConnection,
    TransportEvent, UaTransport, Variant,
};

pub use channel::{Channel, ChannelLost, SecureChannelManager};

pub use session::{Session, SessionManager, SessionRecovery, SessionState, SessionStats, SessionValidity};

pub use subscription::{
    DataChange, MonitoredItem, NotificationSequencer, SequenceCheck, SubscriptionHandle,
    SubscriptionInfo, SubscriptionNotification, SubscriptionParameters, SubscriptionRegistry,
    SubscriptionState, SubscriptionStream,
};

pub use recovery::{RecoveryOutcome, RecoveryReport, RecoveryStats, SubscriptionRecoveryManager};

pub use client::{ClientEvent, ClientStats, ClientStatsSnapshot, ConnectionState, EventStream, UaClient};
