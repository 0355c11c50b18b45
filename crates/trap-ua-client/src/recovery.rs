// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription recovery.
//!
//! After the channel and session are back, every subscription is reconciled
//! with the server. Whether the server still holds a subscription is found
//! out empirically:
//!
//! - **Resumed**: Republish of the next expected sequence number is accepted
//!   (or answers "no such message"). Republish is then repeated until the
//!   server has nothing more, and every message goes through the
//!   subscription's sequencer.
//! - **Recreated**: the server answers `BadSubscriptionIdInvalid`. A new
//!   subscription with the same requested parameters is created and every
//!   monitored item is re-created from its cached definition. Values
//!   produced while the subscription was gone are lost.
//!
//! When the session itself had to be recreated, TransferSubscriptions is
//! tried first; subscriptions it cannot move are recreated.
//!
//! Subscriptions are recovered concurrently. A failure of one does not stop
//! the others; it is retried later. A network failure aborts the whole
//! attempt so the reconnection loop can start over.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::channel::{unexpected_response, Channel};
use crate::config::ClientConfig;
use crate::error::{SubscriptionError, UaError, UaResult};
use crate::session::{SessionManager, SessionRecovery};
use crate::subscription::{
    successor, Delivery, MonitoredItem, RevisedParameters, SubscriptionHandle,
    SubscriptionRegistry, SubscriptionState,
};
use crate::transport::{NotificationMessage, ServiceRequest, ServiceResponse};
use crate::types::StatusCode;

/// Upper bound on Republish calls spent on one steady-state gap.
const MAX_REPUBLISH_PER_GAP: u32 = 256;

// =============================================================================
// Outcomes
// =============================================================================

/// How one subscription came back.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// The server still held it; `republished` messages were recovered.
    Resumed {
        /// Messages recovered through Republish.
        republished: u32,
    },
    /// The server had dropped it and it was recreated.
    Recreated {
        /// Server id of the lost subscription.
        previous: u32,
        /// Server id of the new subscription.
        subscription_id: u32,
    },
    /// It had never been created on the server and now is.
    Created {
        /// Server id.
        subscription_id: u32,
    },
    /// Recovery failed; it will be retried.
    Failed {
        /// Cause.
        error: UaError,
    },
}

impl RecoveryOutcome {
    /// Returns `true` unless the outcome is [`RecoveryOutcome::Failed`].
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resumed { republished } => write!(f, "resumed ({republished} republished)"),
            Self::Recreated { previous, subscription_id } => {
                write!(f, "recreated ({previous} -> {subscription_id})")
            }
            Self::Created { subscription_id } => write!(f, "created ({subscription_id})"),
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Result of one recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Outcome per subscription.
    pub outcomes: Vec<(SubscriptionHandle, RecoveryOutcome)>,
    /// Gaps reported during the pass.
    pub gaps: Vec<(SubscriptionHandle, RangeInclusive<u32>)>,
}

impl RecoveryReport {
    /// Number of resumed subscriptions.
    pub fn resumed(&self) -> usize {
        self.count(|o| matches!(o, RecoveryOutcome::Resumed { .. }))
    }

    /// Number of recreated subscriptions.
    pub fn recreated(&self) -> usize {
        self.count(|o| matches!(o, RecoveryOutcome::Recreated { .. }))
    }

    /// Number of failed subscriptions.
    pub fn failed(&self) -> usize {
        self.count(|o| !o.is_success())
    }

    fn count(&self, predicate: impl Fn(&RecoveryOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| predicate(o)).count()
    }
}

// =============================================================================
// RecoveryStats
// =============================================================================

/// Counters kept across recovery passes.
#[derive(Debug, Default)]
pub struct RecoveryStats {
    resumed: AtomicU64,
    recreated: AtomicU64,
    failed: AtomicU64,
    republished: AtomicU64,
    gaps: AtomicU64,
}

impl RecoveryStats {
    /// Subscriptions resumed.
    pub fn resumed(&self) -> u64 {
        self.resumed.load(Ordering::Relaxed)
    }

    /// Subscriptions recreated.
    pub fn recreated(&self) -> u64 {
        self.recreated.load(Ordering::Relaxed)
    }

    /// Failed recoveries.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Messages recovered through Republish.
    pub fn republished(&self) -> u64 {
        self.republished.load(Ordering::Relaxed)
    }

    /// Gaps reported.
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }
}

// =============================================================================
// SubscriptionRecoveryManager
// =============================================================================

#[derive(Debug, Clone)]
enum Plan {
    Resume { available: Option<Vec<u32>> },
    Recreate,
    Create,
}

/// Everything a recovery step talks to.
#[derive(Clone, Copy)]
pub struct RecoveryContext<'a> {
    /// Channel to use.
    pub channel: &'a Channel,
    /// Active session.
    pub session: &'a SessionManager,
    /// Subscriptions.
    pub registry: &'a SubscriptionRegistry,
}

/// Reconciles client-side subscriptions with the server.
#[derive(Debug)]
pub struct SubscriptionRecoveryManager {
    request_timeout: Duration,
    republish_timeout: Duration,
    stats: Arc<RecoveryStats>,
}

impl SubscriptionRecoveryManager {
    /// Creates a recovery manager.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            republish_timeout: config.republish_timeout,
            stats: Arc::new(RecoveryStats::default()),
        }
    }

    /// Returns the counters.
    pub fn stats(&self) -> &Arc<RecoveryStats> {
        &self.stats
    }

    /// Recovers every subscription after a reconnection.
    pub async fn recover(
        &self,
        cx: RecoveryContext<'_>,
        session_recovery: &SessionRecovery,
    ) -> UaResult<RecoveryReport> {
        let handles = cx.registry.handles();
        if handles.is_empty() {
            return Ok(RecoveryReport::default());
        }

        let transferred = if session_recovery.is_recreated() && cx.registry.has_bound() {
            Some(self.transfer(cx).await?)
        } else {
            None
        };

        let plans: Vec<(SubscriptionHandle, Plan)> = handles
            .into_iter()
            .map(|handle| {
                let bound = cx.registry.snapshot(handle).ok().and_then(|s| s.server_id).is_some();
                let plan = match (&transferred, bound) {
                    (_, false) => Plan::Create,
                    (None, true) => Plan::Resume { available: None },
                    (Some(transferred), true) => match transferred.get(&handle) {
                        Some(available) => Plan::Resume {
                            available: Some(available.clone()),
                        },
                        None => Plan::Recreate,
                    },
                };
                cx.registry.set_state(handle, SubscriptionState::Recovering);
                (handle, plan)
            })
            .collect();

        self.run(cx, plans).await
    }

    /// Retries subscriptions that are not yet bound or failed earlier.
    pub async fn retry_unrecovered(&self, cx: RecoveryContext<'_>) -> UaResult<RecoveryReport> {
        let plans = cx
            .registry
            .unrecovered()
            .into_iter()
            .map(|handle| {
                let bound = cx.registry.snapshot(handle).ok().and_then(|s| s.server_id).is_some();
                let plan = if bound {
                    Plan::Resume { available: None }
                } else {
                    Plan::Create
                };
                (handle, plan)
            })
            .collect::<Vec<_>>();

        if plans.is_empty() {
            return Ok(RecoveryReport::default());
        }
        self.run(cx, plans).await
    }

    async fn run(
        &self,
        cx: RecoveryContext<'_>,
        plans: Vec<(SubscriptionHandle, Plan)>,
    ) -> UaResult<RecoveryReport> {
        let results = join_all(plans.into_iter().map(|(handle, plan)| async move {
            let mut gaps = Vec::new();
            let result = self.recover_one(cx, handle, plan, &mut gaps).await;
            (handle, result, gaps)
        }))
        .await;

        let mut report = RecoveryReport::default();
        let mut abort = None;

        for (handle, result, gaps) in results {
            report.gaps.extend(gaps.into_iter().map(|missing| (handle, missing)));
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(error) if error.is_channel_failure() => {
                    cx.registry.set_state(handle, SubscriptionState::Failed);
                    abort.get_or_insert(error);
                    continue;
                }
                Err(error) => {
                    error.log("subscription recovery");
                    cx.registry.set_state(handle, SubscriptionState::Failed);
                    RecoveryOutcome::Failed { error }
                }
            };

            let counter = match &outcome {
                RecoveryOutcome::Resumed { .. } => Some(&self.stats.resumed),
                RecoveryOutcome::Recreated { .. } => Some(&self.stats.recreated),
                RecoveryOutcome::Failed { .. } => Some(&self.stats.failed),
                RecoveryOutcome::Created { .. } => None,
            };
            if let Some(counter) = counter {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            report.outcomes.push((handle, outcome));
        }

        self.stats
            .gaps
            .fetch_add(report.gaps.len() as u64, Ordering::Relaxed);

        match abort {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    async fn recover_one(
        &self,
        cx: RecoveryContext<'_>,
        handle: SubscriptionHandle,
        plan: Plan,
        gaps: &mut Vec<RangeInclusive<u32>>,
    ) -> UaResult<RecoveryOutcome> {
        let outcome = match plan {
            Plan::Create => self.create(cx, handle, false).await?,
            Plan::Recreate => self.create(cx, handle, true).await?,
            Plan::Resume { available } => match self.resume(cx, handle, available, gaps).await {
                Ok(republished) => {
                    self.create_unbound_items(cx, handle).await?;
                    cx.registry.set_state(handle, SubscriptionState::Active);
                    RecoveryOutcome::Resumed { republished }
                }
                Err(error) if error.status_code() == Some(StatusCode::BAD_SUBSCRIPTION_ID_INVALID) => {
                    self.create(cx, handle, true).await?
                }
                Err(error) => return Err(error),
            },
        };

        info!(subscription = %handle, outcome = %outcome, "Subscription recovered");
        Ok(outcome)
    }

    async fn transfer(&self, cx: RecoveryContext<'_>) -> UaResult<HashMap<SubscriptionHandle, Vec<u32>>> {
        let bound = cx.registry.server_ids();
        let request = ServiceRequest::TransferSubscriptions {
            subscription_ids: bound.iter().map(|(_, id)| *id).collect(),
            send_initial_values: false,
        };

        let results = match cx.session.call(cx.channel, request, self.request_timeout).await {
            Ok(ServiceResponse::TransferSubscriptions { results }) => results,
            Ok(_) => return Err(unexpected_response("TransferSubscriptions")),
            Err(error) if error.is_channel_failure() => return Err(error),
            Err(error) => {
                debug!(error = %error, "TransferSubscriptions not available");
                return Ok(HashMap::new());
            }
        };

        let transferred = bound
            .into_iter()
            .zip(results)
            .filter(|(_, result)| result.status.is_good())
            .map(|((handle, _), result)| (handle, result.available_sequence_numbers))
            .collect::<HashMap<_, _>>();

        debug!(transferred = transferred.len(), "Subscriptions transferred to new session");
        Ok(transferred)
    }

    /// Republishes from the next expected sequence number until the server
    /// has nothing more. Returns the number of messages recovered.
    async fn resume(
        &self,
        cx: RecoveryContext<'_>,
        handle: SubscriptionHandle,
        available: Option<Vec<u32>>,
        gaps: &mut Vec<RangeInclusive<u32>>,
    ) -> UaResult<u32> {
        let snapshot = cx.registry.snapshot(handle)?;
        let Some(server_id) = snapshot.server_id else {
            return Err(UaError::subscription(SubscriptionError::NotFound { handle: handle.0 }));
        };
        let mut next = snapshot.next_sequence_number;

        // Messages older than the server's oldest retained one are gone.
        if let Some(oldest) = available.as_ref().and_then(|a| a.iter().min().copied()) {
            if oldest > next {
                let missing = next..=oldest - 1;
                cx.registry.report_gap(handle, missing.clone());
                gaps.push(missing);
                next = oldest;
            }
        }

        let mut republished = 0;
        loop {
            match self.republish(cx, server_id, next).await {
                Ok(message) => {
                    if let Some(missing) = self.apply(cx, server_id, message) {
                        gaps.push(missing);
                    }
                    republished += 1;
                    next = successor(next);
                }
                Err(error) if is_end_of_backlog(&error) => break,
                Err(error) => return Err(error),
            }
        }

        self.stats
            .republished
            .fetch_add(u64::from(republished), Ordering::Relaxed);
        Ok(republished)
    }

    fn apply(
        &self,
        cx: RecoveryContext<'_>,
        server_id: u32,
        message: NotificationMessage,
    ) -> Option<RangeInclusive<u32>> {
        match cx.registry.deliver(server_id, message) {
            Delivery::Gap {
                handle,
                missing,
                held,
                ..
            } => {
                cx.registry.report_gap(handle, missing.clone());
                if let Some(held) = held {
                    cx.registry.deliver(server_id, held);
                }
                Some(missing)
            }
            _ => None,
        }
    }

    async fn republish(
        &self,
        cx: RecoveryContext<'_>,
        subscription_id: u32,
        sequence_number: u32,
    ) -> UaResult<NotificationMessage> {
        let request = ServiceRequest::Republish {
            subscription_id,
            retransmit_sequence_number: sequence_number,
        };
        match cx.session.call(cx.channel, request, self.republish_timeout).await? {
            ServiceResponse::Republish {
                notification_message,
            } => Ok(notification_message),
            _ => Err(unexpected_response("Republish")),
        }
    }

    /// Fills a gap seen while publishing.
    ///
    /// Each missing message is requested through Republish; whatever the
    /// server can no longer supply is reported as a gap. `held` is delivered
    /// last. Returns the ranges reported as lost.
    pub async fn repair_gap(
        &self,
        cx: RecoveryContext<'_>,
        handle: SubscriptionHandle,
        server_id: u32,
        missing: RangeInclusive<u32>,
        held: Option<NotificationMessage>,
    ) -> UaResult<Vec<RangeInclusive<u32>>> {
        let mut lost = Vec::new();
        let mut lost_from: Option<u32> = None;
        let mut sequence_number = *missing.start();
        let end = *missing.end();
        let mut attempts = 0;

        loop {
            if attempts >= MAX_REPUBLISH_PER_GAP {
                lost_from.get_or_insert(sequence_number);
                break;
            }
            attempts += 1;

            match self.republish(cx, server_id, sequence_number).await {
                Ok(message) => {
                    if let Some(from) = lost_from.take() {
                        let range = from..=message.sequence_number.saturating_sub(1).max(from);
                        cx.registry.report_gap(handle, range.clone());
                        lost.push(range);
                    }
                    if let Some(extra) = self.apply(cx, server_id, message) {
                        lost.push(extra);
                    }
                    self.stats.republished.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) if is_end_of_backlog(&error) => {
                    lost_from.get_or_insert(sequence_number);
                }
                Err(error) => return Err(error),
            }

            if sequence_number == end {
                break;
            }
            sequence_number = successor(sequence_number);
        }

        if let Some(from) = lost_from {
            let range = from..=end;
            cx.registry.report_gap(handle, range.clone());
            lost.push(range);
        }

        for range in &lost {
            warn!(
                subscription = %handle,
                error = %UaError::notification_gap(server_id, range.clone()),
                "Notifications lost"
            );
        }
        self.stats.gaps.fetch_add(lost.len() as u64, Ordering::Relaxed);

        if let Some(held) = held {
            cx.registry.deliver(server_id, held);
        }
        Ok(lost)
    }

    /// Creates a subscription on the server and all its items.
    ///
    /// `lost` marks a recreation of a subscription the server dropped.
    pub async fn create(
        &self,
        cx: RecoveryContext<'_>,
        handle: SubscriptionHandle,
        lost: bool,
    ) -> UaResult<RecoveryOutcome> {
        let snapshot = cx.registry.snapshot(handle)?;
        let request = ServiceRequest::CreateSubscription {
            parameters: snapshot.parameters,
        };

        let revised = match cx.session.call(cx.channel, request, self.request_timeout).await? {
            ServiceResponse::CreateSubscription {
                subscription_id,
                revised_publishing_interval,
                revised_lifetime_count,
                revised_max_keepalive_count,
            } => RevisedParameters {
                subscription_id,
                publishing_interval: revised_publishing_interval,
                lifetime_count: revised_lifetime_count,
                max_keepalive_count: revised_max_keepalive_count,
            },
            _ => return Err(unexpected_response("CreateSubscription")),
        };

        let previous = snapshot.server_id;
        cx.registry.bind(handle, revised, lost)?;

        if let (true, Some(previous)) = (lost, previous) {
            UaError::subscription(SubscriptionError::Lost {
                subscription_id: previous,
            })
            .log("subscription recovery");
        }

        if !snapshot.items.is_empty() {
            self.create_items(cx, handle, revised.subscription_id, &snapshot.items)
                .await?;
        }

        Ok(match (lost, previous) {
            (true, Some(previous)) => RecoveryOutcome::Recreated {
                previous,
                subscription_id: revised.subscription_id,
            },
            _ => RecoveryOutcome::Created {
                subscription_id: revised.subscription_id,
            },
        })
    }

    async fn create_unbound_items(&self, cx: RecoveryContext<'_>, handle: SubscriptionHandle) -> UaResult<()> {
        let snapshot = cx.registry.snapshot(handle)?;
        match snapshot.server_id {
            Some(server_id) if !snapshot.unbound_items.is_empty() => {
                self.create_items(cx, handle, server_id, &snapshot.unbound_items)
                    .await
                    .map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Creates monitored items. Returns the number rejected by the server.
    pub async fn create_items(
        &self,
        cx: RecoveryContext<'_>,
        handle: SubscriptionHandle,
        subscription_id: u32,
        items: &[MonitoredItem],
    ) -> UaResult<usize> {
        let request = ServiceRequest::CreateMonitoredItems {
            subscription_id,
            items: items.to_vec(),
        };
        let results = match cx.session.call(cx.channel, request, self.request_timeout).await? {
            ServiceResponse::CreateMonitoredItems { results } => results,
            _ => return Err(unexpected_response("CreateMonitoredItems")),
        };

        let rejected = cx.registry.bind_items(handle, items, &results)?;
        for (item, status) in &rejected {
            UaError::subscription(SubscriptionError::MonitoredItemRejected {
                node_id: item.node_id.to_string(),
                status: *status,
            })
            .log("monitored item creation");
        }
        Ok(rejected.len())
    }

    /// Deletes a server subscription. Best effort.
    pub async fn delete(&self, cx: RecoveryContext<'_>, subscription_id: u32) {
        let request = ServiceRequest::DeleteSubscriptions {
            subscription_ids: vec![subscription_id],
        };
        if let Err(error) = cx.session.call(cx.channel, request, self.request_timeout).await {
            debug!(subscription_id, error = %error, "DeleteSubscriptions failed");
        }
    }
}

fn is_end_of_backlog(error: &UaError) -> bool {
    matches!(
        error.status_code(),
        Some(StatusCode::BAD_MESSAGE_NOT_AVAILABLE | StatusCode::BAD_SEQUENCE_NUMBER_UNKNOWN)
    )
}

// =============================================================================
// Tests
// =============================================================================
