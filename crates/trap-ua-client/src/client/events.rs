// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Lifecycle events and client statistics.
//!
//! Events are emitted by the connection driver only, in order, to every
//! listener through its own unbounded queue; a slow listener never makes
//! another miss an event.

use std::fmt;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::UaError;
use crate::recovery::RecoveryOutcome;
use crate::subscription::SubscriptionHandle;
use crate::types::NodeId;

// =============================================================================
// ClientEvent
// =============================================================================

/// Event surfaced to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A retry was scheduled after `delay`.
    Backoff {
        /// 1-based retry number within the current episode.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// The connection was lost; once per outage episode.
    StartReconnection,
    /// Channel and session are back; once per outage episode.
    ConnectionReestablished,
    /// All subscriptions are recovered; ends the outage episode.
    AfterReconnection,
    /// The client is disconnected. `None` after `disconnect()`.
    Close {
        /// Terminal error, if any.
        error: Option<Arc<UaError>>,
    },
    /// The session had to be recreated.
    SessionRecreated {
        /// Lost session.
        previous: Option<NodeId>,
        /// New session.
        session_id: NodeId,
    },
    /// A subscription was reconciled with the server.
    SubscriptionRecovered {
        /// Subscription.
        handle: SubscriptionHandle,
        /// How it came back.
        outcome: RecoveryOutcome,
    },
    /// Notifications were lost.
    NotificationGap {
        /// Subscription.
        handle: SubscriptionHandle,
        /// Missing sequence numbers.
        missing: RangeInclusive<u32>,
    },
    /// A keep-alive probe failed; the channel is being replaced.
    KeepAliveFailed {
        /// Cause.
        error: Arc<UaError>,
    },
}

impl ClientEvent {
    /// Returns the event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Backoff { .. } => "backoff",
            Self::StartReconnection => "start_reconnection",
            Self::ConnectionReestablished => "connection_reestablished",
            Self::AfterReconnection => "after_reconnection",
            Self::Close { .. } => "close",
            Self::SessionRecreated { .. } => "session_recreated",
            Self::SubscriptionRecovered { .. } => "subscription_recovered",
            Self::NotificationGap { .. } => "notification_gap",
            Self::KeepAliveFailed { .. } => "keepalive_failed",
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff { attempt, delay } => write!(f, "backoff #{attempt} ({delay:?})"),
            Self::Close { error: Some(error) } => write!(f, "close: {error}"),
            Self::NotificationGap { handle, missing } => {
                write!(f, "notification gap on {handle}: {missing:?}")
            }
            other => f.write_str(other.name()),
        }
    }
}

// =============================================================================
// EventHub / EventStream
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct EventHub {
    listeners: Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.lock().push(sender);
        EventStream { receiver }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        tracing::debug!(event = %event, "Client event");
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

/// Stream of [`ClientEvent`]s.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<ClientEvent>,
}

impl EventStream {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.receiver.recv().await
    }

    /// Returns an event if one is queued.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = ClientEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

// =============================================================================
// ClientStats
// =============================================================================

/// Client-wide counters.
#[derive(Debug, Default)]
pub struct ClientStats {
    connect_attempts: AtomicU64,
    backoffs: AtomicU64,
    reconnections: AtomicU64,
    reestablished: AtomicU64,
    closes: AtomicU64,
    session_recreations: AtomicU64,
    subscriptions_resumed: AtomicU64,
    subscriptions_recreated: AtomicU64,
    notification_gaps: AtomicU64,
    notifications: AtomicU64,
    keepalive_failures: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStatsSnapshot {
    /// Connection attempts, first attempts included.
    pub connect_attempts: u64,
    /// Backoff events.
    pub backoffs: u64,
    /// Outage episodes.
    pub reconnections: u64,
    /// Episodes in which channel and session were restored.
    pub reestablished: u64,
    /// Close events.
    pub closes: u64,
    /// Sessions recreated after an outage.
    pub session_recreations: u64,
    /// Subscriptions resumed.
    pub subscriptions_resumed: u64,
    /// Subscriptions recreated.
    pub subscriptions_recreated: u64,
    /// Gaps reported.
    pub notification_gaps: u64,
    /// Notification messages delivered.
    pub notifications: u64,
    /// Failed keep-alive probes.
    pub keepalive_failures: u64,
}

impl ClientStats {
    pub(crate) fn record_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, event: &ClientEvent) {
        let counter = match event {
            ClientEvent::Backoff { .. } => &self.backoffs,
            ClientEvent::StartReconnection => &self.reconnections,
            ClientEvent::ConnectionReestablished => &self.reestablished,
            ClientEvent::Close { .. } => &self.closes,
            ClientEvent::SessionRecreated { .. } => &self.session_recreations,
            ClientEvent::SubscriptionRecovered { outcome, .. } => match outcome {
                RecoveryOutcome::Resumed { .. } => &self.subscriptions_resumed,
                RecoveryOutcome::Recreated { .. } => &self.subscriptions_recreated,
                _ => return,
            },
            ClientEvent::NotificationGap { .. } => &self.notification_gaps,
            ClientEvent::KeepAliveFailed { .. } => &self.keepalive_failures,
            ClientEvent::AfterReconnection => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of backoff events.
    pub fn backoffs(&self) -> u64 {
        self.backoffs.load(Ordering::Relaxed)
    }

    /// Number of outage episodes.
    pub fn reconnections(&self) -> u64 {
        self.reconnections.load(Ordering::Relaxed)
    }

    /// Number of close events.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Number of notification messages delivered.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    /// Returns a copy of all counters.
    pub fn snapshot(&self) -> ClientStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ClientStatsSnapshot {
            connect_attempts: load(&self.connect_attempts),
            backoffs: load(&self.backoffs),
            reconnections: load(&self.reconnections),
            reestablished: load(&self.reestablished),
            closes: load(&self.closes),
            session_recreations: load(&self.session_recreations),
            subscriptions_resumed: load(&self.subscriptions_resumed),
            subscriptions_recreated: load(&self.subscriptions_recreated),
            notification_gaps: load(&self.notification_gaps),
            notifications: load(&self.notifications),
            keepalive_failures: load(&self.keepalive_failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_every_listener_gets_every_event() {
        let hub = EventHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.emit(ClientEvent::StartReconnection);
        hub.emit(ClientEvent::Backoff {
            attempt: 1,
            delay: Duration::from_millis(5),
        });

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.next().await.unwrap().name(), "start_reconnection");
            assert_eq!(stream.next().await.unwrap().name(), "backoff");
        }
    }

    #[test]
    fn test_dropped_listeners_are_pruned() {
        let hub = EventHub::default();
        drop(hub.subscribe());
        hub.emit(ClientEvent::AfterReconnection);
        assert!(hub.listeners.lock().is_empty());
    }

    #[test]
    fn test_stats_record() {
        let stats = ClientStats::default();
        stats.record(&ClientEvent::StartReconnection);
        stats.record(&ClientEvent::Close { error: None });
        stats.record(&ClientEvent::SubscriptionRecovered {
            handle: SubscriptionHandle(1),
            outcome: RecoveryOutcome::Resumed { republished: 0 },
        });
        stats.record_attempt();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.reconnections, 1);
        assert_eq!(snapshot.closes, 1);
        assert_eq!(snapshot.subscriptions_resumed, 1);
        assert_eq!(snapshot.connect_attempts, 1);
        assert_eq!(snapshot.backoffs, 0);
    }
}
