// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session lifecycle state machine.
//!
//! A [`Session`] owns exactly one [`AccessToken`] at a time and moves through
//! a fixed set of states: `Created` → (`CreatedTokenLoaded` | `Opening`) →
//! `Opened` ⇄ `OpenedTokenUpdated` → (`Closed` | `ClosedLoginFailed`). The
//! closed states are terminal; a new session must be constructed to log in
//! again. All state access goes through one per-session lock, and observer
//! notifications are dispatched after the lock is released so an observer may
//! call back into the session. A session's durable state can be captured as a
//! schema-versioned [`SessionSnapshot`] and restored in a later process.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{
    AgentResult, AuthAgent, AuthOutcome, AuthorizationCoordinator, AuthorizationRequest,
    CoordinatorStep, LoginBehavior,
};
use crate::config;
use crate::error::{AuthError, SessionError, StoreError};
use crate::graph::{RequestBatch, Response};
use crate::token::{AccessToken, AuthBundle, TokenBundle, TokenStore};

/// Minimum time between token-extension attempts.
pub const TOKEN_EXTEND_RETRY_SECONDS: i64 = 60 * 60;

/// Minimum token age (since last refresh) before extension is considered.
pub const TOKEN_EXTEND_THRESHOLD_SECONDS: i64 = 24 * 60 * 60;

const PUBLISH_PERMISSION_PREFIX: &str = "publish";
const MANAGE_PERMISSION_PREFIX: &str = "manage";
const OTHER_PUBLISH_PERMISSIONS: &[&str] = &["ads_management", "create_event", "rsvp_event"];

/// Whether a permission name requires a publish-type authorization.
pub fn is_publish_permission(permission: &str) -> bool {
    permission.starts_with(PUBLISH_PERMISSION_PREFIX)
        || permission.starts_with(MANAGE_PERMISSION_PREFIX)
        || OTHER_PUBLISH_PERMISSIONS.contains(&permission)
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Fresh session, no usable token.
    Created,
    /// A still-valid cached token was found at construction.
    CreatedTokenLoaded,
    /// An authorization flow is in flight.
    Opening,
    /// Valid token held; safe to drive API calls.
    Opened,
    /// Re-entrant variant of `Opened` after a token or permission change.
    OpenedTokenUpdated,
    /// Terminal: closed normally.
    Closed,
    /// Terminal: the login attempt failed or was aborted.
    ClosedLoginFailed,
}

impl SessionState {
    pub fn is_opened(&self) -> bool {
        matches!(self, Self::Opened | Self::OpenedTokenUpdated)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::ClosedLoginFailed)
    }
}

/// Current snapshot schema version.
///
/// Version history:
/// - v1: application id, state, token bundle
/// - v2: adds the last extension-attempt timestamp
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

/// Serialized form of a session, for save/restore across process runs.
///
/// Timestamps are milliseconds since the epoch, matching [`TokenBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub application_id: String,
    pub state: SessionState,
    pub token: TokenBundle,
    #[serde(default)]
    pub last_extend_attempt_at: i64,
}

impl SessionSnapshot {
    /// Parse a snapshot from its JSON form, migrating older schema versions.
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_str(raw)?;
        let version = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::Corrupted("missing schema_version".to_string()))?
            as u32;

        match version {
            // v1 snapshots predate the extension-attempt timestamp; serde's
            // default fills in the epoch.
            1 | 2 => {
                let mut snapshot: SessionSnapshot = serde_json::from_value(value)?;
                snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION;
                Ok(snapshot)
            }
            other => Err(StoreError::UnsupportedSchemaVersion(other)),
        }
    }

    /// Serialize the snapshot to its JSON form.
    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Authorization class requested when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthType {
    Read,
    Publish,
}

/// What the caller must do after feeding an external result to the session.
pub enum AuthContinuation {
    /// Nothing further; any state change was delivered to observers.
    Done,
    /// Execute this batch and hand the responses to
    /// [`Session::complete_validation`].
    ValidationRequired(RequestBatch),
}

/// Observer of session state changes. Fired once per transition with the new
/// state; `error` is set when the transition was caused by a failure.
pub type StateChangeObserver = Arc<dyn Fn(&Session, SessionState, Option<&AuthError>) + Send + Sync>;

struct SessionData {
    state: SessionState,
    token: AccessToken,
    pending_request: Option<AuthorizationRequest>,
    coordinator: Option<AuthorizationCoordinator>,
    last_extend_attempt: DateTime<Utc>,
    extend_in_flight: bool,
}

struct SessionInner {
    application_id: String,
    token_store: Arc<dyn TokenStore>,
    agent: Option<Arc<dyn AuthAgent>>,
    data: Mutex<SessionData>,
    observers: Mutex<Vec<StateChangeObserver>>,
}

/// One authenticated login lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

type Notification = (SessionState, Option<AuthError>);

impl Session {
    /// Construct a session, restoring a cached token if the store holds a
    /// still-valid one.
    pub fn new(
        application_id: impl Into<String>,
        token_store: Arc<dyn TokenStore>,
        agent: Option<Arc<dyn AuthAgent>>,
    ) -> Self {
        let mut state = SessionState::Created;
        let mut token = AccessToken::empty();

        match token_store.load() {
            Ok(Some(bundle)) => {
                let cached = AccessToken::from_cache_bundle(&bundle);
                if cached.is_invalid() {
                    // A stale bundle is useless; drop it now.
                    if let Err(e) = token_store.clear() {
                        #[cfg(feature = "telemetry")]
                        tracing::warn!(error = %e, "failed to clear stale token bundle");
                        let _ = e;
                    }
                } else {
                    token = cached;
                    state = SessionState::CreatedTokenLoaded;
                }
            }
            Ok(None) => {}
            Err(e) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(error = %e, "failed to load cached token bundle");
                let _ = e;
            }
        }

        Self {
            inner: Arc::new(SessionInner {
                application_id: application_id.into(),
                token_store,
                agent,
                data: Mutex::new(SessionData {
                    state,
                    token,
                    pending_request: None,
                    coordinator: None,
                    last_extend_attempt: DateTime::<Utc>::MIN_UTC,
                    extend_in_flight: false,
                }),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Capture the session's persistent state for save/restore.
    pub fn to_snapshot(&self) -> SessionSnapshot {
        let data = self.lock_data();
        SessionSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            application_id: self.inner.application_id.clone(),
            state: data.state,
            token: data.token.to_cache_bundle(),
            last_extend_attempt_at: data.last_extend_attempt.timestamp_millis(),
        }
    }

    /// Reconstruct a session from a snapshot.
    ///
    /// An authorization that was in flight cannot cross a process boundary,
    /// so an `Opening` snapshot restores as `Created`; an open snapshot whose
    /// token expired while at rest restores as `Closed`.
    pub fn from_snapshot(
        snapshot: &SessionSnapshot,
        token_store: Arc<dyn TokenStore>,
        agent: Option<Arc<dyn AuthAgent>>,
    ) -> Self {
        let token = AccessToken::from_cache_bundle(&snapshot.token);
        let (state, token) = match snapshot.state {
            SessionState::Opening => (SessionState::Created, AccessToken::empty()),
            SessionState::CreatedTokenLoaded if token.is_invalid() => {
                (SessionState::Created, AccessToken::empty())
            }
            SessionState::Opened | SessionState::OpenedTokenUpdated if token.is_invalid() => {
                (SessionState::Closed, AccessToken::empty())
            }
            state if state.is_closed() => (state, AccessToken::empty()),
            state => (state, token),
        };

        Self {
            inner: Arc::new(SessionInner {
                application_id: snapshot.application_id.clone(),
                token_store,
                agent,
                data: Mutex::new(SessionData {
                    state,
                    token,
                    pending_request: None,
                    coordinator: None,
                    last_extend_attempt: DateTime::from_timestamp_millis(
                        snapshot.last_extend_attempt_at,
                    )
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    extend_in_flight: false,
                }),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.inner.application_id
    }

    pub fn state(&self) -> SessionState {
        self.lock_data().state
    }

    pub fn access_token(&self) -> AccessToken {
        self.lock_data().token.clone()
    }

    pub fn permissions(&self) -> BTreeSet<String> {
        self.lock_data().token.permissions().clone()
    }

    pub fn is_opened(&self) -> bool {
        self.lock_data().state.is_opened()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_data().state.is_closed()
    }

    /// Whether two handles refer to the same session.
    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn add_state_change_observer(&self, observer: StateChangeObserver) {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    // ============================================================
    // Opening and reauthorization
    // ============================================================

    /// Open the session for read access. `permissions` must not contain any
    /// publish or manage class permission.
    pub fn open_for_read(
        &self,
        permissions: Vec<String>,
        behavior: LoginBehavior,
    ) -> Result<(), SessionError> {
        self.open(permissions, behavior, AuthType::Read)
    }

    /// Open the session for publish access. `permissions` must be non-empty
    /// and should consist of publish or manage class permissions.
    pub fn open_for_publish(
        &self,
        permissions: Vec<String>,
        behavior: LoginBehavior,
    ) -> Result<(), SessionError> {
        self.open(permissions, behavior, AuthType::Publish)
    }

    fn open(
        &self,
        permissions: Vec<String>,
        behavior: LoginBehavior,
        auth_type: AuthType,
    ) -> Result<(), SessionError> {
        validate_permissions(&permissions, auth_type)?;

        let mut notifications: Vec<Notification> = Vec::new();
        let start_result: Result<Option<Result<(), AuthError>>, SessionError> = {
            let mut data = self.lock_data();
            match data.state {
                SessionState::Created | SessionState::CreatedTokenLoaded => {}
                SessionState::Opening => return Err(SessionError::PendingRequest),
                SessionState::Opened | SessionState::OpenedTokenUpdated => {
                    return Err(SessionError::AlreadyOpened)
                }
                SessionState::Closed | SessionState::ClosedLoginFailed => {
                    return Err(SessionError::ClosedSessionReuse)
                }
            }
            if data.pending_request.is_some() {
                return Err(SessionError::PendingRequest);
            }

            // Subset fast path: a loaded cached token already covering the
            // requested permissions opens with no user interaction.
            if data.state == SessionState::CreatedTokenLoaded
                && permissions
                    .iter()
                    .all(|p| data.token.permissions().contains(p))
            {
                let old = data.state;
                data.state = SessionState::Opened;
                push_transition(&mut notifications, old, data.state, None);
                Ok(None)
            } else {
                let agent = self.inner.agent.clone().ok_or(SessionError::NoAuthAgent)?;

                let mut request =
                    AuthorizationRequest::new(self.inner.application_id.clone(), permissions);
                request.set_behavior(behavior);

                let old = data.state;
                data.state = SessionState::Opening;
                push_transition(&mut notifications, old, data.state, None);

                let mut coordinator = AuthorizationCoordinator::new(agent);
                let started = coordinator.start(request.clone());
                if started.is_ok() {
                    data.pending_request = Some(request);
                    data.coordinator = Some(coordinator);
                }
                Ok(Some(started))
            }
        };

        self.dispatch(notifications);

        if let Some(Err(e)) = start_result? {
            // No strategy could start; the login fails terminally.
            self.finish_auth_or_reauth(AuthOutcome::Error(e));
        }
        Ok(())
    }

    /// Request additional read permissions on an open session. The new token
    /// must belong to the same user as the current one.
    pub fn request_new_read_permissions(
        &self,
        permissions: Vec<String>,
        behavior: LoginBehavior,
    ) -> Result<(), SessionError> {
        validate_permissions(&permissions, AuthType::Read)?;
        self.reauthorize(permissions, behavior)
    }

    /// Request additional publish permissions on an open session.
    pub fn request_new_publish_permissions(
        &self,
        permissions: Vec<String>,
        behavior: LoginBehavior,
    ) -> Result<(), SessionError> {
        validate_permissions(&permissions, AuthType::Publish)?;
        self.reauthorize(permissions, behavior)
    }

    fn reauthorize(
        &self,
        permissions: Vec<String>,
        behavior: LoginBehavior,
    ) -> Result<(), SessionError> {
        let start_result: Result<(), AuthError> = {
            let mut data = self.lock_data();
            if data.state.is_closed() {
                return Err(SessionError::ClosedSessionReuse);
            }
            if !data.state.is_opened() {
                return Err(SessionError::NotOpened("reauthorize".to_string()));
            }
            if data.pending_request.is_some() {
                return Err(SessionError::PendingRequest);
            }
            let agent = self.inner.agent.clone().ok_or(SessionError::NoAuthAgent)?;

            let mut request =
                AuthorizationRequest::new(self.inner.application_id.clone(), permissions);
            request.set_behavior(behavior);
            request.set_previous_token(data.token.clone());

            let mut coordinator = AuthorizationCoordinator::new(agent);
            let started = coordinator.start(request.clone());
            if started.is_ok() {
                data.pending_request = Some(request);
                data.coordinator = Some(coordinator);
            }
            started
        };

        if let Err(e) = start_result {
            // A failed reauthorization leaves the open session open.
            self.finish_auth_or_reauth(AuthOutcome::Error(e));
        }
        Ok(())
    }

    /// Feed the result of an external authorization flow back in.
    pub fn continue_authorization(
        &self,
        result: AgentResult,
    ) -> Result<AuthContinuation, SessionError> {
        let step = {
            let mut data = self.lock_data();
            let Some(coordinator) = data.coordinator.as_mut() else {
                return Err(SessionError::NotOpened("continue authorization".to_string()));
            };
            coordinator.on_agent_result(result)
        };

        match step {
            Ok(CoordinatorStep::Pending) => Ok(AuthContinuation::Done),
            Ok(CoordinatorStep::Validate(batch)) => Ok(AuthContinuation::ValidationRequired(batch)),
            Ok(CoordinatorStep::Completed(outcome)) => {
                self.finish_auth_or_reauth(outcome);
                Ok(AuthContinuation::Done)
            }
            Err(e) => {
                self.finish_auth_or_reauth(AuthOutcome::Error(e));
                Ok(AuthContinuation::Done)
            }
        }
    }

    /// Resolve a pending same-user validation with the responses of the batch
    /// returned by [`AuthContinuation::ValidationRequired`].
    pub fn complete_validation(&self, responses: &[Response]) {
        let outcome = {
            let mut data = self.lock_data();
            match data.coordinator.as_mut() {
                Some(coordinator) => coordinator.on_validation_responses(responses),
                None => AuthOutcome::Error(AuthError::NoPendingRequest),
            }
        };
        self.finish_auth_or_reauth(outcome);
    }

    /// Apply the final outcome of an authorization or reauthorization.
    ///
    /// A token that fails the validity invariant is a failure regardless of
    /// what the external flow reported.
    fn finish_auth_or_reauth(&self, outcome: AuthOutcome) {
        let mut notifications: Vec<Notification> = Vec::new();
        {
            let mut data = self.lock_data();
            data.pending_request = None;
            data.coordinator = None;

            let outcome = match outcome {
                AuthOutcome::Success(token) if token.is_invalid() => {
                    AuthOutcome::Error(AuthError::InvalidToken)
                }
                other => other,
            };

            let old = data.state;
            match outcome {
                AuthOutcome::Success(token) => {
                    data.token = token;
                    self.save_token_locked(&data);
                    data.state = if old == SessionState::Opening {
                        SessionState::Opened
                    } else {
                        SessionState::OpenedTokenUpdated
                    };
                    push_transition(&mut notifications, old, data.state, None);
                }
                AuthOutcome::Cancelled(message) => {
                    self.fail_auth_locked(
                        &mut data,
                        &mut notifications,
                        AuthError::Cancelled(message),
                    );
                }
                AuthOutcome::Error(error) => {
                    self.fail_auth_locked(&mut data, &mut notifications, error);
                }
            }
        }
        self.dispatch(notifications);
    }

    fn fail_auth_locked(
        &self,
        data: &mut SessionData,
        notifications: &mut Vec<Notification>,
        error: AuthError,
    ) {
        let old = data.state;
        if old == SessionState::Opening {
            // A failed first login is terminal.
            data.state = SessionState::ClosedLoginFailed;
            data.token = AccessToken::empty();
        }
        // A failed permission refresh leaves an open session open; the error
        // alone is delivered.
        push_transition(notifications, old, data.state, Some(error));
    }

    // ============================================================
    // Closing
    // ============================================================

    /// Close the session. Closing before a login completed records the login
    /// as failed; closing an open session is a normal close. The persisted
    /// token bundle is left intact.
    pub fn close(&self) {
        let mut notifications: Vec<Notification> = Vec::new();
        {
            let mut data = self.lock_data();
            let old = data.state;
            let new = match old {
                SessionState::Created | SessionState::Opening => {
                    Some(SessionState::ClosedLoginFailed)
                }
                SessionState::CreatedTokenLoaded
                | SessionState::Opened
                | SessionState::OpenedTokenUpdated => Some(SessionState::Closed),
                SessionState::Closed | SessionState::ClosedLoginFailed => None,
            };
            if let Some(new) = new {
                data.state = new;
                data.token = AccessToken::empty();
                data.pending_request = None;
                if let Some(coordinator) = data.coordinator.as_mut() {
                    coordinator.cancel();
                }
                data.coordinator = None;
                push_transition(&mut notifications, old, new, None);
            }
        }
        self.dispatch(notifications);
    }

    /// Close the session and erase the persisted token bundle, so the next
    /// session for this store starts unauthenticated.
    pub fn close_and_clear_token_information(&self) {
        if let Err(e) = self.inner.token_store.clear() {
            #[cfg(feature = "telemetry")]
            tracing::warn!(error = %e, "failed to clear token bundle");
            let _ = e;
        }
        {
            let mut data = self.lock_data();
            data.token = AccessToken::empty();
        }
        self.close();
    }

    // ============================================================
    // Token extension
    // ============================================================

    /// Whether background token extension should be attempted now.
    pub fn should_extend_access_token(&self) -> bool {
        let data = self.lock_data();
        self.should_extend_locked(&data, Utc::now())
    }

    fn should_extend_locked(&self, data: &SessionData, now: DateTime<Utc>) -> bool {
        !data.extend_in_flight
            && data.state.is_opened()
            && data.token.source().can_extend_token()
            && now - data.last_extend_attempt >= Duration::seconds(TOKEN_EXTEND_RETRY_SECONDS)
            && now - data.token.last_refresh() >= Duration::seconds(TOKEN_EXTEND_THRESHOLD_SECONDS)
    }

    /// Attempt a silent token extension through the agent if the policy says
    /// it is due. Failure degrades to keeping the current token.
    pub fn extend_access_token_if_needed(&self) {
        let current = {
            let mut data = self.lock_data();
            let now = Utc::now();
            if !self.should_extend_locked(&data, now) {
                return;
            }
            data.last_extend_attempt = now;
            data.extend_in_flight = true;
            data.token.clone()
        };

        let bundle = self
            .inner
            .agent
            .as_ref()
            .and_then(|agent| agent.refresh_token(current.token()));

        match bundle {
            Some(bundle) => self.apply_refresh_bundle(&current, &bundle),
            None => {
                let mut data = self.lock_data();
                data.extend_in_flight = false;
            }
        }
    }

    fn apply_refresh_bundle(&self, current: &AccessToken, bundle: &AuthBundle) {
        let mut notifications: Vec<Notification> = Vec::new();
        {
            let mut data = self.lock_data();
            data.extend_in_flight = false;

            let refreshed = AccessToken::from_refresh(current, bundle);
            if refreshed.is_invalid() || !data.state.is_opened() {
                return;
            }
            data.token = refreshed;
            self.save_token_locked(&data);

            let old = data.state;
            data.state = SessionState::OpenedTokenUpdated;
            push_transition(&mut notifications, old, data.state, None);
        }
        self.dispatch(notifications);
    }

    // ============================================================
    // Internals
    // ============================================================

    fn lock_data(&self) -> MutexGuard<'_, SessionData> {
        self.inner.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save_token_locked(&self, data: &SessionData) {
        if let Err(e) = self.inner.token_store.save(&data.token.to_cache_bundle()) {
            #[cfg(feature = "telemetry")]
            tracing::warn!(error = %e, "failed to persist token bundle");
            let _ = e;
        }
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let observers = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match config::callback_handle() {
            Some(handle) => {
                let session = self.clone();
                let _ = handle.spawn(async move { notify(&session, &observers, &notifications) });
            }
            None => notify(self, &observers, &notifications),
        }
    }
}

fn notify(session: &Session, observers: &[StateChangeObserver], notifications: &[Notification]) {
    for (state, error) in notifications {
        #[cfg(feature = "telemetry")]
        tracing::debug!(state = ?state, error = ?error.as_ref().map(|e| e.to_string()), "session state change");
        for observer in observers {
            observer(session, *state, error.as_ref());
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.lock_data();
        f.debug_struct("Session")
            .field("application_id", &self.inner.application_id)
            .field("state", &data.state)
            .field("token", &config::loggable_token(data.token.token()))
            .finish()
    }
}

/// Record a transition for observer dispatch, skipping a same-state
/// transition unless it is the re-entrant token update or carries an error.
fn push_transition(
    notifications: &mut Vec<Notification>,
    old: SessionState,
    new: SessionState,
    error: Option<AuthError>,
) {
    if old == new && new != SessionState::OpenedTokenUpdated && error.is_none() {
        return;
    }
    notifications.push((new, error));
}

fn validate_permissions(permissions: &[String], auth_type: AuthType) -> Result<(), SessionError> {
    match auth_type {
        AuthType::Publish => {
            if permissions.is_empty() {
                return Err(SessionError::EmptyPublishPermissions);
            }
        }
        AuthType::Read => {
            for permission in permissions {
                if is_publish_permission(permission) {
                    return Err(SessionError::PublishPermissionOnRead(permission.clone()));
                }
            }
        }
    }
    Ok(())
}
