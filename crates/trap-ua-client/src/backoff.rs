// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Retry timing for connection attempts.
//!
//! [`ConnectionStrategy`] describes the policy; [`BackoffScheduler`] walks it.
//! Delays follow `min(max_delay, initial_delay * growth_factor^(retry-1))`
//! and are then jittered by `± randomisation_factor * delay`, clamped to
//! `[0, max_delay]`.
//!
//! The scheduler reports every retry through an `on_attempt(retry, delay)`
//! callback *before* waiting, and reports exhaustion at most once. Once
//! [`BackoffCanceller::cancel`] has returned, no callback fires again: every
//! callback runs under the same gate the canceller takes.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use trap_ua_client::backoff::{ConnectionStrategy, MaxRetry};
//!
//! let strategy = ConnectionStrategy::default()
//!     .with_max_retry(MaxRetry::Bounded(3))
//!     .with_initial_delay(Duration::from_millis(100))
//!     .with_max_delay(Duration::from_secs(2))
//!     .with_randomisation_factor(0.0);
//!
//! assert_eq!(strategy.base_delay(1), Duration::from_millis(100));
//! assert_eq!(strategy.base_delay(2), Duration::from_millis(150));
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigurationError, UaError};

// =============================================================================
// MaxRetry
// =============================================================================

/// Upper bound on retries after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MaxRetryRepr", into = "MaxRetryRepr")]
pub enum MaxRetry {
    /// At most this many retries.
    Bounded(u32),
    /// Retry forever.
    Unbounded,
}

impl MaxRetry {
    /// Returns `true` if retry number `retry` (1-based) is permitted.
    #[inline]
    pub fn allows(&self, retry: u32) -> bool {
        match self {
            Self::Bounded(max) => retry <= *max,
            Self::Unbounded => true,
        }
    }
}

impl Default for MaxRetry {
    fn default() -> Self {
        Self::Unbounded
    }
}

impl fmt::Display for MaxRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(max) => write!(f, "{max}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MaxRetryRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<MaxRetryRepr> for MaxRetry {
    type Error = String;

    fn try_from(value: MaxRetryRepr) -> Result<Self, Self::Error> {
        match value {
            MaxRetryRepr::Count(max) => Ok(Self::Bounded(max)),
            MaxRetryRepr::Keyword(word) if word.eq_ignore_ascii_case("unbounded") => {
                Ok(Self::Unbounded)
            }
            MaxRetryRepr::Keyword(word) => Err(format!(
                "invalid max_retry '{word}', expected an integer or \"unbounded\""
            )),
        }
    }
}

impl From<MaxRetry> for MaxRetryRepr {
    fn from(value: MaxRetry) -> Self {
        match value {
            MaxRetry::Bounded(max) => Self::Count(max),
            MaxRetry::Unbounded => Self::Keyword("unbounded".to_string()),
        }
    }
}

// =============================================================================
// ConnectionStrategy
// =============================================================================

/// Retry policy for connection and reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStrategy {
    /// Maximum number of retries after the first attempt.
    #[serde(default)]
    pub max_retry: MaxRetry,

    /// Delay before the first retry.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any delay, jitter included.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Jitter as a fraction of the delay, in `[0, 1]`.
    #[serde(default = "default_randomisation_factor")]
    pub randomisation_factor: f64,

    /// Multiplier applied per retry.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_randomisation_factor() -> f64 {
    0.1
}

fn default_growth_factor() -> f64 {
    1.5
}

impl Default for ConnectionStrategy {
    fn default() -> Self {
        Self {
            max_retry: MaxRetry::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            randomisation_factor: default_randomisation_factor(),
            growth_factor: default_growth_factor(),
        }
    }
}

impl ConnectionStrategy {
    /// Sets the retry bound.
    pub fn with_max_retry(mut self, max_retry: MaxRetry) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the randomisation factor.
    pub fn with_randomisation_factor(mut self, factor: f64) -> Self {
        self.randomisation_factor = factor;
        self
    }

    /// Sets the growth factor.
    pub fn with_growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Validates this strategy.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigurationError::invalid_value(
                "connection_strategy.initial_delay",
                format!(
                    "{:?} exceeds max_delay {:?}",
                    self.initial_delay, self.max_delay
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.randomisation_factor) {
            return Err(ConfigurationError::invalid_value(
                "connection_strategy.randomisation_factor",
                format!("{} is outside [0, 1]", self.randomisation_factor),
            ));
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "connection_strategy.growth_factor",
                format!("{} must be a finite value >= 1", self.growth_factor),
            ));
        }
        Ok(())
    }

    /// Returns the un-jittered delay before retry number `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let initial = self.initial_delay.as_nanos() as f64;
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let grown = initial * self.growth_factor.powi(exponent);
        let capped = grown.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped.max(0.0).round() as u64)
    }

    /// Returns the jittered delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        apply_jitter(
            self.base_delay(retry),
            self.randomisation_factor,
            self.max_delay,
        )
    }
}

/// Spreads `delay` by `± factor * delay`, never below zero nor above `max`.
fn apply_jitter(delay: Duration, factor: f64, max: Duration) -> Duration {
    let nanos = delay.as_nanos() as f64;
    let spread = nanos * factor;
    if spread <= 0.0 {
        return delay.min(max);
    }

    let offset = rand::rng().random_range(-spread..=spread);
    let jittered = (nanos + offset).clamp(0.0, max.as_nanos() as f64);
    Duration::from_nanos(jittered.round() as u64)
}

// =============================================================================
// Cancellation gate
// =============================================================================

#[derive(Debug, Default)]
struct Gate {
    cancelled: Mutex<bool>,
    token: CancellationToken,
}

impl Gate {
    /// Runs `f` unless cancelled. Holds the gate while `f` runs.
    fn fire<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let cancelled = self.cancelled.lock();
        if *cancelled {
            return None;
        }
        Some(f())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }
}

/// Cancels a [`BackoffScheduler`] from any task.
///
/// Callbacks must not call [`cancel`](Self::cancel) on their own scheduler.
#[derive(Debug, Clone)]
pub struct BackoffCanceller {
    gate: Arc<Gate>,
}

impl BackoffCanceller {
    /// Stops pending waits and suppresses all further callbacks. Idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self.gate.cancelled.lock();
        *cancelled = true;
        self.gate.token.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// Resolves when the scheduler is cancelled.
    pub async fn cancelled(&self) {
        self.gate.token.cancelled().await;
    }
}

// =============================================================================
// BackoffScheduler
// =============================================================================

/// Result of one [`BackoffScheduler::next_backoff`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// The delay elapsed; make retry number `attempt`.
    Retry {
        /// 1-based retry number.
        attempt: u32,
        /// Delay that was waited.
        delay: Duration,
    },
    /// The retry bound is reached.
    Exhausted,
    /// The scheduler was cancelled.
    Cancelled,
}

/// Terminal result of [`BackoffScheduler::start`].
#[derive(Debug)]
pub enum BackoffOutcome<T> {
    /// An attempt succeeded.
    Succeeded(T),
    /// Every permitted attempt failed.
    Exhausted {
        /// Number of attempts made, the first one included.
        attempts: u32,
        /// Error of the last attempt.
        last: UaError,
    },
    /// Cancelled before an attempt succeeded.
    Cancelled,
}

/// Walks a [`ConnectionStrategy`].
#[derive(Debug)]
pub struct BackoffScheduler {
    strategy: ConnectionStrategy,
    retries: u32,
    exhausted: bool,
    gate: Arc<Gate>,
}

impl BackoffScheduler {
    /// Creates a scheduler for `strategy`.
    pub fn new(strategy: ConnectionStrategy) -> Self {
        Self {
            strategy,
            retries: 0,
            exhausted: false,
            gate: Arc::new(Gate::default()),
        }
    }

    /// Returns a handle that cancels this scheduler.
    pub fn canceller(&self) -> BackoffCanceller {
        BackoffCanceller {
            gate: Arc::clone(&self.gate),
        }
    }

    /// Returns the strategy.
    pub fn strategy(&self) -> &ConnectionStrategy {
        &self.strategy
    }

    /// Returns the number of retries scheduled so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns `true` if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// Restarts the delay sequence. Cancellation is not undone.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.exhausted = false;
    }

    /// Schedules the next retry.
    ///
    /// Calls `on_attempt(retry, delay)` before waiting `delay`, then returns
    /// [`BackoffStep::Retry`]. Returns [`BackoffStep::Exhausted`] without a
    /// callback once the bound is reached.
    pub async fn next_backoff<A>(&mut self, on_attempt: A) -> BackoffStep
    where
        A: FnOnce(u32, Duration),
    {
        if self.exhausted || !self.strategy.max_retry.allows(self.retries + 1) {
            self.exhausted = true;
            return BackoffStep::Exhausted;
        }

        self.retries += 1;
        let attempt = self.retries;
        let delay = self.strategy.delay_for(attempt);

        if self.gate.fire(|| on_attempt(attempt, delay)).is_none() {
            return BackoffStep::Cancelled;
        }

        tokio::select! {
            biased;
            _ = self.gate.token.cancelled() => BackoffStep::Cancelled,
            _ = tokio::time::sleep(delay) => {
                if self.gate.is_cancelled() {
                    BackoffStep::Cancelled
                } else {
                    BackoffStep::Retry { attempt, delay }
                }
            }
        }
    }

    /// Runs `attempt` until it succeeds, the strategy is exhausted or the
    /// scheduler is cancelled.
    ///
    /// `attempt` receives the retry number (0 for the first attempt).
    /// `on_attempt` fires once per retry before its delay; `on_exhausted`
    /// fires at most once, with the last error. A cancelled scheduler drops
    /// the in-flight attempt.
    pub async fn start<T, F, Fut, A, X>(
        &mut self,
        mut attempt: F,
        mut on_attempt: A,
        on_exhausted: X,
    ) -> BackoffOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UaError>>,
        A: FnMut(u32, Duration),
        X: FnOnce(&UaError),
    {
        let mut retry = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.gate.token.cancelled() => return BackoffOutcome::Cancelled,
                result = attempt(retry) => result,
            };

            let error = match result {
                Ok(value) if !self.gate.is_cancelled() => return BackoffOutcome::Succeeded(value),
                Ok(_) => return BackoffOutcome::Cancelled,
                Err(error) => error,
            };

            tracing::debug!(
                retry,
                max_retry = %self.strategy.max_retry,
                error = %error,
                "Connection attempt failed"
            );

            match self.next_backoff(&mut on_attempt).await {
                BackoffStep::Retry { attempt, .. } => retry = attempt,
                BackoffStep::Cancelled => return BackoffOutcome::Cancelled,
                BackoffStep::Exhausted => {
                    return match self.gate.fire(|| on_exhausted(&error)) {
                        Some(()) => BackoffOutcome::Exhausted {
                            attempts: retry + 1,
                            last: error,
                        },
                        None => BackoffOutcome::Cancelled,
                    };
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
