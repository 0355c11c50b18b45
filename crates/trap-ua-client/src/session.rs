// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session lifecycle management.
//!
//! A session is a server-tracked identity that may outlive several secure
//! channels. After a reconnection the [`SessionManager`] decides whether the
//! previous session can be reused: the local timeout heuristic can only rule
//! a session out, while re-activating it on the new channel is the
//! authoritative check.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::channel::{unexpected_response, Channel};
use crate::config::ClientConfig;
use crate::error::{ErrorKind, SessionError, TimeoutError, UaError, UaResult};
use crate::transport::{AuthenticationToken, ServiceRequest, ServiceResponse};
use crate::types::{AttributeId, NodeId, UserIdentity};

// =============================================================================
// SessionState
// =============================================================================

/// State of the client's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session exists.
    #[default]
    NotCreated,

    /// CreateSession is in progress.
    Creating,

    /// ActivateSession is in progress.
    Activating,

    /// Session is active on the current channel.
    Active,

    /// Session is being re-activated on a new channel.
    Reactivating,

    /// CloseSession is in progress.
    Closing,

    /// Session was closed by the client.
    Closed,

    /// Server no longer knows the session.
    Expired,
}

impl SessionState {
    /// Returns `true` if the session is active.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns `true` in transitional states.
    #[inline]
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Activating | Self::Reactivating | Self::Closing
        )
    }

    /// Returns `true` if a session must be created before use.
    #[inline]
    pub fn needs_creation(&self) -> bool {
        matches!(self, Self::NotCreated | Self::Closed | Self::Expired)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotCreated => "NotCreated",
            Self::Creating => "Creating",
            Self::Activating => "Activating",
            Self::Active => "Active",
            Self::Reactivating => "Reactivating",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Expired => "Expired",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Server-assigned session identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id.
    pub session_id: NodeId,
    /// Token sent with every request.
    pub authentication_token: AuthenticationToken,
    /// Timeout the client asked for.
    pub requested_timeout: Duration,
    /// Timeout granted by the server.
    pub effective_timeout: Duration,
    /// When the session was created.
    pub created_at: Instant,
}

/// Verdict of [`SessionManager::validate_after_reconnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionValidity {
    /// The server still knows the session and it is active on the new channel.
    Valid,
    /// The session is gone.
    Expired,
}

/// Result of [`SessionManager::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRecovery {
    /// The previous session was re-activated.
    Reused,
    /// A new session was created.
    Recreated {
        /// Id of the session that was lost, if there was one.
        previous: Option<NodeId>,
    },
}

impl SessionRecovery {
    /// Returns `true` for [`SessionRecovery::Recreated`].
    pub fn is_recreated(&self) -> bool {
        matches!(self, Self::Recreated { .. })
    }
}

type StateCallback = Box<dyn Fn(SessionState, SessionState) + Send + Sync>;

// =============================================================================
// SessionManager
// =============================================================================

/// Creates, re-activates, probes and closes the client's session.
pub struct SessionManager {
    application_name: String,
    session_name: String,
    identity: UserIdentity,
    requested_timeout: Duration,
    request_timeout: Duration,
    keepalive_timeout: Duration,
    keepalive_ratio: f64,

    session: Option<Session>,
    state: SessionState,
    last_activity: Mutex<Instant>,
    stats: Arc<SessionStats>,
    on_state_change: Option<StateCallback>,
}

impl SessionManager {
    /// Creates a session manager.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            application_name: config.application_name.clone(),
            session_name: config.session_name.clone(),
            identity: config.user_identity.clone(),
            requested_timeout: config.requested_session_timeout,
            request_timeout: config.request_timeout,
            keepalive_timeout: config.keepalive_timeout,
            keepalive_ratio: config.keepalive_ratio,
            session: None,
            state: SessionState::NotCreated,
            last_activity: Mutex::new(Instant::now()),
            stats: Arc::new(SessionStats::default()),
            on_state_change: None,
        }
    }

    /// Sets a callback for state changes.
    pub fn set_state_change_callback<F>(&mut self, callback: F)
    where
        F: Fn(SessionState, SessionState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the current session.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Returns the session statistics.
    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Returns the authentication token of the active session.
    pub fn authentication_token(&self) -> UaResult<AuthenticationToken> {
        match (&self.session, self.state) {
            (Some(session), SessionState::Active) => Ok(session.authentication_token),
            _ => Err(UaError::session(SessionError::NotActivated)),
        }
    }

    /// Records traffic on the session.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Returns the time since the last successful request.
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns how long the session may stay idle before a keep-alive probe.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .map(|session| session.effective_timeout.mul_f64(self.keepalive_ratio))
    }

    /// Sends a request on behalf of the active session.
    pub async fn call(
        &self,
        channel: &Channel,
        request: ServiceRequest,
        timeout: Duration,
    ) -> UaResult<ServiceResponse> {
        let token = self.authentication_token()?;
        let response = channel.call(Some(token), request, timeout).await?;
        self.touch();
        Ok(response)
    }

    /// Creates a new session on `channel` and activates it.
    pub async fn create_and_activate(&mut self, channel: &Channel) -> UaResult<Session> {
        self.session = None;
        self.set_state(SessionState::Creating);

        let response = channel
            .call(
                None,
                ServiceRequest::CreateSession {
                    application_name: self.application_name.clone(),
                    session_name: self.session_name.clone(),
                    endpoint_url: channel.endpoint().to_string(),
                    requested_timeout: self.requested_timeout,
                },
                self.request_timeout,
            )
            .await;

        let session = match response {
            Ok(ServiceResponse::CreateSession {
                session_id,
                authentication_token,
                revised_timeout,
            }) => Session {
                session_id,
                authentication_token,
                requested_timeout: self.requested_timeout,
                effective_timeout: revised_timeout,
                created_at: Instant::now(),
            },
            Ok(_) => return Err(self.fail(unexpected_response("CreateSession"))),
            Err(error) => return Err(self.fail(error)),
        };

        self.set_state(SessionState::Activating);
        if let Err(error) = self.activate_on(channel, session.authentication_token).await {
            return Err(self.fail(error));
        }

        self.touch();
        self.stats.creations.fetch_add(1, Ordering::Relaxed);
        self.stats.activations.fetch_add(1, Ordering::Relaxed);
        self.session = Some(session.clone());
        self.set_state(SessionState::Active);

        tracing::info!(
            session_id = %session.session_id,
            effective_timeout = ?session.effective_timeout,
            user = self.identity.user(),
            "Session created and activated"
        );
        Ok(session)
    }

    async fn activate_on(&self, channel: &Channel, token: AuthenticationToken) -> UaResult<()> {
        let response = channel
            .call(
                Some(token),
                ServiceRequest::ActivateSession {
                    identity: self.identity.clone(),
                },
                self.request_timeout,
            )
            .await;

        match response {
            Ok(ServiceResponse::ActivateSession) => Ok(()),
            Ok(_) => Err(unexpected_response("ActivateSession")),
            Err(error) => match error.status_code() {
                Some(status) if error.kind() == ErrorKind::AuthenticationFailure => {
                    Err(UaError::identity_rejected(self.identity.user(), status))
                }
                _ => Err(error),
            },
        }
    }

    /// Decides whether the session survived an outage of `outage`.
    ///
    /// An outage at least as long as the effective timeout rules the session
    /// out without a round trip. Otherwise the session is re-activated on
    /// `channel`; a session fault from the server means it expired. Other
    /// errors fail the reconnection attempt.
    pub async fn validate_after_reconnection(
        &mut self,
        channel: &Channel,
        outage: Duration,
    ) -> UaResult<SessionValidity> {
        let Some(session) = self.session.clone() else {
            return Ok(SessionValidity::Expired);
        };

        if outage >= session.effective_timeout {
            tracing::info!(
                session_id = %session.session_id,
                outage = ?outage,
                effective_timeout = ?session.effective_timeout,
                "Outage exceeded session timeout"
            );
            self.expire();
            return Ok(SessionValidity::Expired);
        }

        self.set_state(SessionState::Reactivating);
        match self.activate_on(channel, session.authentication_token).await {
            Ok(()) => {
                self.touch();
                self.stats.activations.fetch_add(1, Ordering::Relaxed);
                self.set_state(SessionState::Active);
                tracing::debug!(session_id = %session.session_id, "Session re-activated on new channel");
                Ok(SessionValidity::Valid)
            }
            Err(error) if error.kind() == ErrorKind::SessionExpired => {
                tracing::info!(
                    session_id = %session.session_id,
                    error = %error,
                    "Server no longer knows the session"
                );
                self.expire();
                Ok(SessionValidity::Expired)
            }
            Err(error) => {
                // The verdict is unknown; the next attempt probes again.
                self.set_state(SessionState::Reactivating);
                Err(error)
            }
        }
    }

    /// Re-activates the previous session on `channel` or creates a new one.
    ///
    /// The outage is measured from the last request the session completed,
    /// so a session created earlier in the same episode is judged by its own
    /// age.
    pub async fn recover(&mut self, channel: &Channel) -> UaResult<SessionRecovery> {
        let outage = self.idle();
        let previous = self.session.as_ref().map(|s| s.session_id.clone());

        if self.validate_after_reconnection(channel, outage).await? == SessionValidity::Valid {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            return Ok(SessionRecovery::Reused);
        }

        self.create_and_activate(channel).await?;
        if previous.is_some() {
            self.stats.recreations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(SessionRecovery::Recreated { previous })
    }

    /// Probes the server when the session has been idle too long.
    ///
    /// Returns `Ok(true)` when a probe was sent. Errors are channel-health
    /// signals for the caller.
    pub async fn keep_alive(&self, channel: &Channel) -> UaResult<bool> {
        let Some(interval) = self.keepalive_interval() else {
            return Ok(false);
        };
        if !self.state.is_active() || self.idle() < interval {
            return Ok(false);
        }

        let response = self
            .call(
                channel,
                ServiceRequest::Read {
                    node_id: NodeId::server_current_time(),
                    attribute_id: AttributeId::Value,
                },
                self.keepalive_timeout,
            )
            .await;

        match response {
            Ok(ServiceResponse::Read { value }) => {
                self.stats.keepalives.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(server_time = %value.value, "Keep-alive");
                Ok(true)
            }
            Ok(_) => Err(unexpected_response("Read")),
            Err(error) => {
                self.stats.keepalive_failures.fetch_add(1, Ordering::Relaxed);
                match error {
                    UaError::Timeout(TimeoutError::Request { .. }) => {
                        Err(UaError::timeout(TimeoutError::KeepAlive(self.keepalive_timeout)))
                    }
                    error => Err(error),
                }
            }
        }
    }

    /// Closes the session. Best effort: errors are logged, not returned.
    pub async fn close(&mut self, channel: Option<&Channel>, delete_subscriptions: bool) {
        if self.session.is_none() {
            return;
        }

        if let (Some(channel), Ok(token)) = (channel, self.authentication_token()) {
            self.set_state(SessionState::Closing);
            let result = channel
                .call(
                    Some(token),
                    ServiceRequest::CloseSession {
                        delete_subscriptions,
                    },
                    self.request_timeout,
                )
                .await;
            match result {
                Ok(ServiceResponse::CloseSession) => {}
                Ok(_) => tracing::debug!("Unexpected response to CloseSession"),
                Err(error) => tracing::debug!(error = %error, "CloseSession failed"),
            }
        }

        if let Some(session) = self.session.take() {
            tracing::info!(session_id = %session.session_id, "Session closed");
        }
        self.set_state(SessionState::Closed);
    }

    /// Forgets the session without talking to the server.
    pub fn expire(&mut self) {
        self.session = None;
        self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        self.set_state(SessionState::Expired);
    }

    fn fail(&mut self, error: UaError) -> UaError {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        self.session = None;
        self.set_state(SessionState::NotCreated);
        tracing::debug!(error = %error, "Session establishment failed");
        error
    }

    fn set_state(&mut self, new_state: SessionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state != new_state {
            tracing::trace!(old_state = %old_state, new_state = %new_state, "Session state changed");
            if let Some(callback) = &self.on_state_change {
                callback(old_state, new_state);
            }
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state)
            .field("session", &self.session.as_ref().map(|s| &s.session_id))
            .finish()
    }
}

// =============================================================================
// SessionStats
// =============================================================================

/// Statistics for session operations.
#[derive(Debug, Default)]
pub struct SessionStats {
    creations: AtomicU64,
    activations: AtomicU64,
    reuses: AtomicU64,
    recreations: AtomicU64,
    expirations: AtomicU64,
    keepalives: AtomicU64,
    keepalive_failures: AtomicU64,
    failures: AtomicU64,
}

impl SessionStats {
    /// Number of sessions created.
    pub fn creations(&self) -> u64 {
        self.creations.load(Ordering::Relaxed)
    }

    /// Number of successful activations, re-activations included.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Number of sessions reused after a reconnection.
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of sessions recreated after a reconnection.
    pub fn recreations(&self) -> u64 {
        self.recreations.load(Ordering::Relaxed)
    }

    /// Number of sessions found expired.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Number of keep-alive probes answered.
    pub fn keepalives(&self) -> u64 {
        self.keepalives.load(Ordering::Relaxed)
    }

    /// Number of keep-alive probes that failed.
    pub fn keepalive_failures(&self) -> u64 {
        self.keepalive_failures.load(Ordering::Relaxed)
    }

    /// Number of failed create/activate sequences.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::test_support::{open_scripted_channel, Script};
    use crate::transport::DataValue;
    use crate::types::StatusCode;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new("opc.tcp://localhost:4840");
        config.requested_session_timeout = Duration::from_millis(500);
        config.keepalive_ratio = 0.1;
        config
    }

    fn server(session_known: Arc<AtomicBool>) -> Script {
        Arc::new(move |request| match request {
            ServiceRequest::CreateSession { requested_timeout, .. } => {
                session_known.store(true, Ordering::SeqCst);
                Ok(ServiceResponse::CreateSession {
                    session_id: NodeId::numeric(1, 42),
                    authentication_token: AuthenticationToken::new_random(),
                    revised_timeout: requested_timeout,
                })
            }
            ServiceRequest::ActivateSession { .. } => {
                if session_known.load(Ordering::SeqCst) {
                    Ok(ServiceResponse::ActivateSession)
                } else {
                    Err(UaError::service_fault("ActivateSession", StatusCode::BAD_SESSION_ID_INVALID))
                }
            }
            ServiceRequest::Read { .. } => Ok(ServiceResponse::Read {
                value: DataValue::new(chrono::Utc::now()),
            }),
            ServiceRequest::CloseSession { .. } => Ok(ServiceResponse::CloseSession),
            other => Err(unexpected_response(other.name())),
        })
    }

    #[test]
    fn test_session_state() {
        assert!(SessionState::Active.is_active());
        assert!(SessionState::Reactivating.is_transitioning());
        assert!(!SessionState::Active.is_transitioning());
        assert!(SessionState::Expired.needs_creation());
        assert!(!SessionState::Active.needs_creation());
    }

    #[tokio::test]
    async fn test_create_and_activate() {
        let known = Arc::new(AtomicBool::new(false));
        let (_manager, channel) = open_scripted_channel(server(known)).await;
        let mut sessions = SessionManager::new(&config());

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        sessions.set_state_change_callback(move |_, new| seen.lock().push(new));

        let session = sessions.create_and_activate(&channel).await.unwrap();
        assert_eq!(session.effective_timeout, Duration::from_millis(500));
        assert_eq!(sessions.state(), SessionState::Active);
        assert!(sessions.authentication_token().is_ok());
        assert_eq!(
            *transitions.lock(),
            vec![SessionState::Creating, SessionState::Activating, SessionState::Active]
        );
    }

    #[tokio::test]
    async fn test_recover_reuses_known_session() {
        let known = Arc::new(AtomicBool::new(false));
        let (_manager, channel) = open_scripted_channel(server(Arc::clone(&known))).await;
        let mut sessions = SessionManager::new(&config());
        sessions.create_and_activate(&channel).await.unwrap();

        let recovery = sessions.recover(&channel).await.unwrap();
        assert_eq!(recovery, SessionRecovery::Reused);
        assert_eq!(sessions.stats().reuses(), 1);
        assert_eq!(sessions.stats().creations(), 1);
    }

    #[tokio::test]
    async fn test_server_verdict_is_authoritative() {
        let known = Arc::new(AtomicBool::new(false));
        let (_manager, channel) = open_scripted_channel(server(Arc::clone(&known))).await;
        let mut sessions = SessionManager::new(&config());
        sessions.create_and_activate(&channel).await.unwrap();

        // Within the timeout, but the server dropped the session.
        known.store(false, Ordering::SeqCst);
        let recovery = sessions.recover(&channel).await.unwrap();
        assert!(recovery.is_recreated());
        assert_eq!(sessions.stats().recreations(), 1);
        assert_eq!(sessions.stats().expirations(), 1);
    }

    #[tokio::test]
    async fn test_long_outage_recreates_without_probe() {
        let known = Arc::new(AtomicBool::new(false));
        let (_manager, channel) = open_scripted_channel(server(Arc::clone(&known))).await;
        let mut sessions = SessionManager::new(&config());
        let first = sessions.create_and_activate(&channel).await.unwrap();

        let validity = sessions
            .validate_after_reconnection(&channel, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(validity, SessionValidity::Expired);
        assert_eq!(sessions.state(), SessionState::Expired);

        let recovery = sessions.recover(&channel).await.unwrap();
        assert_eq!(recovery, SessionRecovery::Recreated { previous: None });
        assert_ne!(
            sessions.session().unwrap().authentication_token,
            first.authentication_token
        );
    }

    #[tokio::test]
    async fn test_keep_alive_only_when_idle() {
        let known = Arc::new(AtomicBool::new(false));
        let (_manager, channel) = open_scripted_channel(server(known)).await;
        let mut sessions = SessionManager::new(&config());
        sessions.create_and_activate(&channel).await.unwrap();

        assert!(!sessions.keep_alive(&channel).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sessions.keep_alive(&channel).await.unwrap());
        assert_eq!(sessions.stats().keepalives(), 1);
    }

    #[tokio::test]
    async fn test_recreated_session_outlives_failed_episode_attempt() {
        let known = Arc::new(AtomicBool::new(false));
        let (_manager, channel) = open_scripted_channel(server(known)).await;
        let mut config = config();
        config.requested_session_timeout = Duration::from_millis(150);
        let mut sessions = SessionManager::new(&config);
        let first = sessions.create_and_activate(&channel).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let recovery = sessions.recover(&channel).await.unwrap();
        assert_eq!(
            recovery,
            SessionRecovery::Recreated {
                previous: Some(first.session_id.clone())
            }
        );
        let second = sessions.session().cloned().unwrap();

        // The rest of that attempt failed; the next one must keep the new session.
        let recovery = sessions.recover(&channel).await.unwrap();
        assert_eq!(recovery, SessionRecovery::Reused);
        assert_eq!(
            sessions.session().unwrap().authentication_token,
            second.authentication_token
        );
        assert_eq!(sessions.stats().creations(), 2);
    }

    #[tokio::test]
    async fn test_close() {
        let known = Arc::new(AtomicBool::new(false));
        let answer = server(known);
        let closes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&closes);
        let script: Script = Arc::new(move |request| {
            if let ServiceRequest::CloseSession { delete_subscriptions } = &request {
                seen.lock().push(*delete_subscriptions);
            }
            answer(request)
        });
        let (_manager, channel) = open_scripted_channel(script).await;
        let mut sessions = SessionManager::new(&config());
        sessions.create_and_activate(&channel).await.unwrap();

        sessions.close(Some(&channel), true).await;
        assert_eq!(*closes.lock(), vec![true]);
        assert_eq!(sessions.state(), SessionState::Closed);
        assert!(sessions.session().is_none());
        assert!(sessions.authentication_token().is_err());

        sessions.close(Some(&channel), true).await;
        assert_eq!(closes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_without_channel_forgets_session() {
        let known = Arc::new(AtomicBool::new(false));
        let (_manager, channel) = open_scripted_channel(server(known)).await;
        let mut sessions = SessionManager::new(&config());
        sessions.create_and_activate(&channel).await.unwrap();

        sessions.close(None, true).await;
        assert_eq!(sessions.state(), SessionState::Closed);
        assert!(sessions.session().is_none());
    }
}
