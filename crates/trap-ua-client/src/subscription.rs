// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client-side subscription state.
//!
//! Subscriptions and their monitored items are application intent: they are
//! keyed by a stable [`SubscriptionHandle`] and outlive any number of
//! channel and session replacements. The server subscription id is just the
//! current binding and changes whenever a subscription is recreated.
//!
//! Every notification passes through the subscription's
//! [`NotificationSequencer`] whether it arrives from Publish or Republish,
//! which is what keeps delivery exactly-once and in sequence-number order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::SubscriptionDefaults;
use crate::error::{SubscriptionError, UaError, UaResult};
use crate::transport::{
    DataValue, MonitoredItemCreateResult, NotificationMessage, SubscriptionAcknowledgement,
};
use crate::types::{AttributeId, NodeId, StatusCode};

// =============================================================================
// Identifiers
// =============================================================================

/// Stable client-side handle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u32);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Requested subscription parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParameters {
    /// Publishing interval.
    #[serde(with = "humantime_serde")]
    pub publishing_interval: Duration,
    /// Lifetime count, in publishing intervals.
    pub lifetime_count: u32,
    /// Maximum keep-alive count, in publishing intervals.
    pub max_keepalive_count: u32,
    /// Maximum notifications per publish, 0 for unlimited.
    pub max_notifications_per_publish: u32,
    /// Priority.
    pub priority: u8,
    /// Whether publishing is enabled.
    pub publishing_enabled: bool,
}

impl SubscriptionParameters {
    /// Creates parameters from configured defaults.
    pub fn from_defaults(defaults: &SubscriptionDefaults) -> Self {
        Self {
            publishing_interval: defaults.publishing_interval,
            lifetime_count: defaults.lifetime_count,
            max_keepalive_count: defaults.max_keepalive_count,
            max_notifications_per_publish: defaults.max_notifications_per_publish,
            priority: defaults.priority,
            publishing_enabled: true,
        }
    }

    /// Sets the publishing interval.
    pub fn with_publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = interval;
        self
    }

    /// Sets the lifetime count.
    pub fn with_lifetime_count(mut self, count: u32) -> Self {
        self.lifetime_count = count;
        self
    }

    /// Sets the keep-alive count.
    pub fn with_max_keepalive_count(mut self, count: u32) -> Self {
        self.max_keepalive_count = count;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Validates the parameters.
    pub fn validate(&self) -> UaResult<()> {
        let invalid = |message: &str| {
            Err(UaError::subscription(SubscriptionError::InvalidParameters {
                message: message.to_string(),
            }))
        };

        if self.publishing_interval.is_zero() {
            return invalid("publishing interval must be greater than 0");
        }
        if self.max_keepalive_count == 0 {
            return invalid("keep-alive count must be greater than 0");
        }
        if self.lifetime_count < self.max_keepalive_count.saturating_mul(3) {
            return invalid("lifetime count must be at least three times the keep-alive count");
        }
        Ok(())
    }

    /// Server-side expiry after this many publishing intervals without a
    /// Publish request.
    pub fn lifetime(&self) -> Duration {
        self.publishing_interval.saturating_mul(self.lifetime_count)
    }
}

impl Default for SubscriptionParameters {
    fn default() -> Self {
        Self::from_defaults(&SubscriptionDefaults::default())
    }
}

/// Parameters as revised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisedParameters {
    /// Server subscription id.
    pub subscription_id: u32,
    /// Revised publishing interval.
    pub publishing_interval: Duration,
    /// Revised lifetime count.
    pub lifetime_count: u32,
    /// Revised keep-alive count.
    pub max_keepalive_count: u32,
}

/// Definition of one monitored item.
///
/// Re-creatable from its own fields, which is all recovery needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItem {
    /// Client handle, assigned by the client when the item is added.
    #[serde(default)]
    pub client_handle: u32,
    /// Monitored node.
    pub node_id: NodeId,
    /// Monitored attribute.
    #[serde(default)]
    pub attribute_id: AttributeId,
    /// Sampling interval.
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,
    /// Queue size.
    pub queue_size: u32,
    /// Discard the oldest value when the queue overflows.
    pub discard_oldest: bool,
}

impl MonitoredItem {
    /// Creates an item monitoring the value of `node_id` with default settings.
    pub fn new(node_id: NodeId) -> Self {
        let defaults = SubscriptionDefaults::default();
        Self {
            client_handle: 0,
            node_id,
            attribute_id: AttributeId::Value,
            sampling_interval: defaults.sampling_interval,
            queue_size: defaults.queue_size,
            discard_oldest: true,
        }
    }

    /// Sets the sampling interval.
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Sets the queue size.
    pub fn with_queue_size(mut self, size: u32) -> Self {
        self.queue_size = size;
        self
    }

    /// Sets the overflow policy.
    pub fn with_discard_oldest(mut self, discard_oldest: bool) -> Self {
        self.discard_oldest = discard_oldest;
        self
    }

    /// Sets the monitored attribute.
    pub fn with_attribute(mut self, attribute_id: AttributeId) -> Self {
        self.attribute_id = attribute_id;
        self
    }
}

// =============================================================================
// NotificationSequencer
// =============================================================================

/// Outcome of [`NotificationSequencer::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Next in order.
    Deliver,
    /// Already consumed.
    Duplicate,
    /// Sequence numbers between the last consumed one and this one are missing.
    Gap(RangeInclusive<u32>),
}

/// Tracks the last consumed sequence number of one server subscription.
///
/// Sequence numbers start at 1 and wrap from `u32::MAX` back to 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationSequencer {
    last: u32,
}

const HALF_RANGE: u32 = u32::MAX / 2;

pub(crate) fn successor(n: u32) -> u32 {
    if n == u32::MAX {
        1
    } else {
        n + 1
    }
}

fn predecessor(n: u32) -> u32 {
    if n <= 1 {
        u32::MAX
    } else {
        n - 1
    }
}

fn forward_distance(from: u32, to: u32) -> u32 {
    if to >= from {
        to - from
    } else {
        (u32::MAX - from) + to
    }
}

impl NotificationSequencer {
    /// Creates a sequencer for a fresh subscription.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sequencer that has consumed everything up to `last`.
    pub fn resume_from(last: u32) -> Self {
        Self { last }
    }

    /// Last consumed sequence number, 0 if none.
    pub fn last(&self) -> u32 {
        self.last
    }

    /// Next sequence number expected.
    pub fn next_expected(&self) -> u32 {
        successor(self.last)
    }

    /// Classifies a data message.
    pub fn check(&self, sequence_number: u32) -> SequenceCheck {
        let distance = forward_distance(self.last, sequence_number);
        match distance {
            0 => SequenceCheck::Duplicate,
            1 => SequenceCheck::Deliver,
            d if d > HALF_RANGE => SequenceCheck::Duplicate,
            _ => SequenceCheck::Gap(self.next_expected()..=predecessor(sequence_number)),
        }
    }

    /// Classifies a keep-alive announcing `next_sequence_number`.
    pub fn check_keep_alive(&self, next_sequence_number: u32) -> Option<RangeInclusive<u32>> {
        let distance = forward_distance(self.last, next_sequence_number);
        (distance > 1 && distance <= HALF_RANGE)
            .then(|| self.next_expected()..=predecessor(next_sequence_number))
    }

    /// Marks `sequence_number` as consumed.
    pub fn advance(&mut self, sequence_number: u32) {
        self.last = sequence_number;
    }

    /// Starts over for a recreated subscription.
    pub fn reset(&mut self) {
        self.last = 0;
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// One changed value.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    /// Client handle of the item.
    pub client_handle: u32,
    /// Node of the item, when still known.
    pub node_id: Option<NodeId>,
    /// New value.
    pub value: DataValue,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionNotification {
    /// A notification message, in sequence-number order.
    DataChange {
        /// Sequence number of the message.
        sequence_number: u32,
        /// Server publish time.
        publish_time: DateTime<Utc>,
        /// Changed values.
        changes: Vec<DataChange>,
    },
    /// Messages the server can no longer supply.
    Gap {
        /// Missing sequence numbers.
        missing: RangeInclusive<u32>,
    },
    /// The server had dropped the subscription and it was recreated.
    /// Values produced while it was gone are lost; numbering restarts.
    Recreated,
}

/// Receiving end of a subscription's notifications.
#[derive(Debug)]
pub struct SubscriptionStream {
    handle: SubscriptionHandle,
    receiver: mpsc::UnboundedReceiver<SubscriptionNotification>,
}

impl SubscriptionStream {
    /// Returns the subscription handle.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Waits for the next notification. `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<SubscriptionNotification> {
        self.receiver.recv().await
    }

    /// Returns a notification if one is ready.
    pub fn try_recv(&mut self) -> Option<SubscriptionNotification> {
        self.receiver.try_recv().ok()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Lifecycle of a client-side subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Not yet created on the server.
    #[default]
    Pending,
    /// Bound to a server subscription.
    Active,
    /// Being recovered after a reconnection.
    Recovering,
    /// Last recovery failed; retried later.
    Failed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone)]
struct ItemEntry {
    item: MonitoredItem,
    server_id: Option<u32>,
    status: StatusCode,
}

#[derive(Debug)]
struct Subscription {
    parameters: SubscriptionParameters,
    revised: Option<RevisedParameters>,
    items: BTreeMap<u32, ItemEntry>,
    sequencer: NotificationSequencer,
    state: SubscriptionState,
    pending_acks: Vec<u32>,
    sender: mpsc::UnboundedSender<SubscriptionNotification>,
    delivered: u64,
    gaps: u64,
}

impl Subscription {
    fn server_id(&self) -> Option<u32> {
        self.revised.map(|r| r.subscription_id)
    }

    fn notify(&self, notification: SubscriptionNotification) {
        // A dropped stream only means nobody listens.
        let _ = self.sender.send(notification);
    }
}

/// Copy of a subscription taken for recovery.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    /// Client handle.
    pub handle: SubscriptionHandle,
    /// Current server binding.
    pub server_id: Option<u32>,
    /// Requested parameters.
    pub parameters: SubscriptionParameters,
    /// All item definitions.
    pub items: Vec<MonitoredItem>,
    /// Items without a server binding.
    pub unbound_items: Vec<MonitoredItem>,
    /// Next sequence number expected.
    pub next_sequence_number: u32,
    /// Current state.
    pub state: SubscriptionState,
}

/// Read-only view of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    /// Client handle.
    pub handle: SubscriptionHandle,
    /// State.
    pub state: SubscriptionState,
    /// Requested parameters.
    pub parameters: SubscriptionParameters,
    /// Revised parameters of the current binding.
    pub revised: Option<RevisedParameters>,
    /// Item definitions.
    pub items: Vec<MonitoredItem>,
    /// Last consumed sequence number.
    pub last_sequence_number: u32,
    /// Notification messages delivered.
    pub delivered: u64,
    /// Gaps reported.
    pub gaps: u64,
}

/// Result of [`SubscriptionRegistry::deliver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Delivered to the subscriber.
    Delivered {
        /// Subscription.
        handle: SubscriptionHandle,
        /// Number of data changes.
        changes: usize,
    },
    /// Keep-alive, nothing missing.
    KeepAlive {
        /// Subscription.
        handle: SubscriptionHandle,
    },
    /// Already consumed; dropped.
    Duplicate {
        /// Subscription.
        handle: SubscriptionHandle,
    },
    /// Earlier messages are missing. `held` is delivered after the gap is
    /// repaired or reported.
    Gap {
        /// Subscription.
        handle: SubscriptionHandle,
        /// Server subscription id.
        server_id: u32,
        /// Missing sequence numbers.
        missing: RangeInclusive<u32>,
        /// The message that revealed the gap.
        held: Option<NotificationMessage>,
    },
    /// No subscription is bound to the server id.
    Unknown,
}

// =============================================================================
// SubscriptionRegistry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryInner {
    subscriptions: BTreeMap<SubscriptionHandle, Subscription>,
    by_server_id: HashMap<u32, SubscriptionHandle>,
    next_handle: u32,
    next_client_handle: u32,
}

impl RegistryInner {
    fn get(&self, handle: SubscriptionHandle) -> UaResult<&Subscription> {
        self.subscriptions.get(&handle).ok_or_else(|| not_found(handle))
    }

    fn get_mut(&mut self, handle: SubscriptionHandle) -> UaResult<&mut Subscription> {
        self.subscriptions.get_mut(&handle).ok_or_else(|| not_found(handle))
    }
}

fn not_found(handle: SubscriptionHandle) -> UaError {
    UaError::subscription(SubscriptionError::NotFound { handle: handle.0 })
}

/// All subscriptions of a client.
///
/// Locks are held only for bookkeeping, never across an await point.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription that is not yet created on the server.
    pub fn insert(&self, parameters: SubscriptionParameters) -> SubscriptionStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);
        inner.subscriptions.insert(
            handle,
            Subscription {
                parameters,
                revised: None,
                items: BTreeMap::new(),
                sequencer: NotificationSequencer::new(),
                state: SubscriptionState::Pending,
                pending_acks: Vec::new(),
                sender,
                delivered: 0,
                gaps: 0,
            },
        );
        SubscriptionStream { handle, receiver }
    }

    /// Adds item definitions, assigning client handles.
    pub fn add_items(
        &self,
        handle: SubscriptionHandle,
        items: Vec<MonitoredItem>,
    ) -> UaResult<Vec<MonitoredItem>> {
        let mut inner = self.inner.lock();
        inner.get(handle)?;

        let mut added = Vec::with_capacity(items.len());
        for mut item in items {
            inner.next_client_handle += 1;
            item.client_handle = inner.next_client_handle;
            added.push(item);
        }

        let subscription = inner.get_mut(handle)?;
        for item in &added {
            subscription.items.insert(
                item.client_handle,
                ItemEntry {
                    item: item.clone(),
                    server_id: None,
                    status: StatusCode::GOOD,
                },
            );
        }
        Ok(added)
    }

    /// Removes a subscription. Returns its server id, if bound.
    pub fn remove(&self, handle: SubscriptionHandle) -> UaResult<Option<u32>> {
        let mut inner = self.inner.lock();
        let subscription = inner.subscriptions.remove(&handle).ok_or_else(|| not_found(handle))?;
        let server_id = subscription.server_id();
        if let Some(id) = server_id {
            inner.by_server_id.remove(&id);
        }
        Ok(server_id)
    }

    /// Returns all handles.
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        self.inner.lock().subscriptions.keys().copied().collect()
    }

    /// Returns handles whose last recovery failed or which are not yet created.
    pub fn unrecovered(&self) -> Vec<SubscriptionHandle> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .filter(|(_, s)| matches!(s.state, SubscriptionState::Failed | SubscriptionState::Pending))
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Returns the number of subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Returns `true` if there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if any subscription is bound to the server.
    pub fn has_bound(&self) -> bool {
        !self.inner.lock().by_server_id.is_empty()
    }

    /// Returns the server ids of bound subscriptions.
    pub fn server_ids(&self) -> Vec<(SubscriptionHandle, u32)> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .filter_map(|(handle, s)| s.server_id().map(|id| (*handle, id)))
            .collect()
    }

    /// Returns the handle bound to `server_id`.
    pub fn handle_for(&self, server_id: u32) -> Option<SubscriptionHandle> {
        self.inner.lock().by_server_id.get(&server_id).copied()
    }

    /// Returns a read-only view.
    pub fn info(&self, handle: SubscriptionHandle) -> Option<SubscriptionInfo> {
        let inner = self.inner.lock();
        let s = inner.subscriptions.get(&handle)?;
        Some(SubscriptionInfo {
            handle,
            state: s.state,
            parameters: s.parameters,
            revised: s.revised,
            items: s.items.values().map(|e| e.item.clone()).collect(),
            last_sequence_number: s.sequencer.last(),
            delivered: s.delivered,
            gaps: s.gaps,
        })
    }

    /// Copies what recovery needs.
    pub fn snapshot(&self, handle: SubscriptionHandle) -> UaResult<SubscriptionSnapshot> {
        let inner = self.inner.lock();
        let s = inner.get(handle)?;
        Ok(SubscriptionSnapshot {
            handle,
            server_id: s.server_id(),
            parameters: s.parameters,
            items: s.items.values().map(|e| e.item.clone()).collect(),
            unbound_items: s
                .items
                .values()
                .filter(|e| e.server_id.is_none())
                .map(|e| e.item.clone())
                .collect(),
            next_sequence_number: s.sequencer.next_expected(),
            state: s.state,
        })
    }

    /// Sets the state.
    pub fn set_state(&self, handle: SubscriptionHandle, state: SubscriptionState) {
        if let Some(s) = self.inner.lock().subscriptions.get_mut(&handle) {
            s.state = state;
        }
    }

    /// Binds a subscription to a newly created server subscription.
    ///
    /// Item bindings, pending acknowledgements and the sequencer are reset.
    /// When `recreated`, the subscriber is told that values were lost.
    pub fn bind(
        &self,
        handle: SubscriptionHandle,
        revised: RevisedParameters,
        recreated: bool,
    ) -> UaResult<()> {
        let mut inner = self.inner.lock();
        let previous = inner.get(handle)?.server_id();
        if let Some(id) = previous {
            inner.by_server_id.remove(&id);
        }
        inner.by_server_id.insert(revised.subscription_id, handle);

        let s = inner.get_mut(handle)?;
        s.revised = Some(revised);
        s.sequencer.reset();
        s.pending_acks.clear();
        for entry in s.items.values_mut() {
            entry.server_id = None;
        }
        s.state = SubscriptionState::Active;
        if recreated {
            s.notify(SubscriptionNotification::Recreated);
        }
        Ok(())
    }

    /// Drops the server binding of a subscription.
    pub fn unbind(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock();
        let server_id = inner.subscriptions.get_mut(&handle).and_then(|s| {
            let id = s.server_id();
            s.revised = None;
            s.pending_acks.clear();
            id
        });
        if let Some(id) = server_id {
            inner.by_server_id.remove(&id);
        }
    }

    /// Records CreateMonitoredItems results, in the order of `items`.
    ///
    /// Returns the rejected items.
    pub fn bind_items(
        &self,
        handle: SubscriptionHandle,
        items: &[MonitoredItem],
        results: &[MonitoredItemCreateResult],
    ) -> UaResult<Vec<(MonitoredItem, StatusCode)>> {
        let mut inner = self.inner.lock();
        let s = inner.get_mut(handle)?;
        let mut rejected = Vec::new();
        for (item, result) in items.iter().zip(results) {
            if let Some(entry) = s.items.get_mut(&item.client_handle) {
                entry.status = result.status;
                if result.status.is_good() {
                    entry.server_id = Some(result.monitored_item_id);
                } else {
                    rejected.push((item.clone(), result.status));
                }
            }
        }
        Ok(rejected)
    }

    /// Runs a notification message through the sequencer.
    pub fn deliver(&self, server_id: u32, message: NotificationMessage) -> Delivery {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.by_server_id.get(&server_id).copied() else {
            return Delivery::Unknown;
        };
        let Some(s) = inner.subscriptions.get_mut(&handle) else {
            return Delivery::Unknown;
        };

        if message.is_keep_alive() {
            return match s.sequencer.check_keep_alive(message.sequence_number) {
                Some(missing) => Delivery::Gap {
                    handle,
                    server_id,
                    missing,
                    held: None,
                },
                None => Delivery::KeepAlive { handle },
            };
        }

        match s.sequencer.check(message.sequence_number) {
            SequenceCheck::Duplicate => Delivery::Duplicate { handle },
            SequenceCheck::Gap(missing) => Delivery::Gap {
                handle,
                server_id,
                missing,
                held: Some(message),
            },
            SequenceCheck::Deliver => {
                let sequence_number = message.sequence_number;
                let changes: Vec<DataChange> = message
                    .data_changes
                    .into_iter()
                    .map(|n| DataChange {
                        node_id: s.items.get(&n.client_handle).map(|e| e.item.node_id.clone()),
                        client_handle: n.client_handle,
                        value: n.value,
                    })
                    .collect();
                let count = changes.len();

                s.sequencer.advance(sequence_number);
                s.pending_acks.push(sequence_number);
                s.delivered += 1;
                s.notify(SubscriptionNotification::DataChange {
                    sequence_number,
                    publish_time: message.publish_time,
                    changes,
                });
                Delivery::Delivered {
                    handle,
                    changes: count,
                }
            }
        }
    }

    /// Gives up on `missing`: tells the subscriber and moves the cursor past it.
    pub fn report_gap(&self, handle: SubscriptionHandle, missing: RangeInclusive<u32>) {
        if let Some(s) = self.inner.lock().subscriptions.get_mut(&handle) {
            if s.sequencer.check(*missing.end()) == SequenceCheck::Duplicate {
                return;
            }
            s.sequencer.advance(*missing.end());
            s.gaps += 1;
            s.notify(SubscriptionNotification::Gap { missing });
        }
    }

    /// Drains acknowledgements for the next Publish.
    pub fn take_acknowledgements(&self) -> Vec<SubscriptionAcknowledgement> {
        let mut inner = self.inner.lock();
        let mut acks = Vec::new();
        for s in inner.subscriptions.values_mut() {
            if let Some(subscription_id) = s.server_id() {
                acks.extend(s.pending_acks.drain(..).map(|sequence_number| {
                    SubscriptionAcknowledgement {
                        subscription_id,
                        sequence_number,
                    }
                }));
            }
        }
        acks
    }
}

// =============================================================================
// Tests
// =============================================================================
