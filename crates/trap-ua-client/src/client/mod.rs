// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The connection state machine.
//!
//! - **Handle**: [`UaClient`], the application API
//! - **Driver**: single task per connection lifetime that owns the channel,
//!   the session and all subscription bindings
//! - **Publish loop**: keeps a Publish request outstanding per channel
//! - **Events**: [`ClientEvent`] stream and [`ClientStats`] counters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          UaClient                               │
//! │        (connect / disconnect / subscriptions / events)          │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │ commands
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Driver                                │
//! │    BackoffScheduler · SessionManager · SubscriptionRecovery     │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    SecureChannelManager                         │
//! │                   (UaTransport collaborator)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod driver;
mod events;
mod publish;
mod state;
mod wrapper;

pub use events::{ClientEvent, ClientStats, ClientStatsSnapshot, EventStream};
pub use state::ConnectionState;
pub use wrapper::UaClient;
