// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection state.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle state of a [`UaClient`](super::UaClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to.
    #[default]
    Disconnected,

    /// First connection in progress.
    Connecting,

    /// Channel, session and subscriptions are up.
    Connected,

    /// Connection lost; recovering.
    Reconnecting,

    /// `disconnect()` in progress.
    Disconnecting,
}

impl ConnectionState {
    /// Returns `true` when connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` while reconnecting.
    #[inline]
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting)
    }

    /// Returns `true` while a connection is being attempted or held.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Shared state cell. Readers watch it; the driver and the connect
/// check-and-set write it.
#[derive(Debug)]
pub(crate) struct StateCell {
    sender: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            sender: watch::Sender::new(ConnectionState::Disconnected),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.sender.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.sender.subscribe()
    }

    /// Moves from `from` to `to` atomically. Returns the state found.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        let mut found = from;
        self.sender.send_if_modified(|state| {
            found = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if found == from {
            Ok(())
        } else {
            Err(found)
        }
    }

    pub(crate) fn set(&self, to: ConnectionState) {
        let from = self.sender.send_replace(to);
        if from != to {
            tracing::debug!(from = %from, to = %to, "Connection state changed");
        }
    }
}
