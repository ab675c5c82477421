// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Authorization orchestration.
//!
//! The [`AuthorizationCoordinator`] walks the prioritized strategy list for a
//! request until one strategy starts, waits for the external result, and
//! normalizes whatever comes back into a single [`AuthOutcome`]. A
//! reauthorization additionally proves the new credential belongs to the same
//! user before it is accepted; the verification round trip is handed back to
//! the caller as a ready-made batch so this module stays network-free.

pub mod request;
pub mod strategy;

pub use request::{AuthorizationRequest, DefaultAudience, LoginBehavior};
pub use strategy::{AgentResult, AuthAgent, StartOutcome, StrategyKind};

use std::sync::Arc;

use serde_json::Value;

use crate::error::AuthError;
use crate::graph::{HttpMethod, Request, RequestBatch, Response};
use crate::token::AccessToken;

/// Final, normalized outcome of one authorization attempt.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Success(AccessToken),
    Cancelled(String),
    Error(AuthError),
}

/// What the caller must do next after feeding in an agent result.
pub enum CoordinatorStep {
    /// Authorization finished; act on the outcome.
    Completed(AuthOutcome),
    /// A fallthrough restarted with a later candidate; a new external result
    /// will arrive later.
    Pending,
    /// Execute this verification batch and feed the responses to
    /// [`AuthorizationCoordinator::on_validation_responses`].
    Validate(RequestBatch),
}

/// Drives one authorization attempt through the host's [`AuthAgent`].
pub struct AuthorizationCoordinator {
    agent: Arc<dyn AuthAgent>,
    pending: Option<PendingAttempt>,
}

struct PendingAttempt {
    request: AuthorizationRequest,
    candidates: Vec<StrategyKind>,
    current: Option<StrategyKind>,
    /// Token awaiting same-user validation.
    unvalidated_token: Option<AccessToken>,
}

impl AuthorizationCoordinator {
    pub fn new(agent: Arc<dyn AuthAgent>) -> Self {
        Self {
            agent,
            pending: None,
        }
    }

    /// Whether an attempt is in flight.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Begin an attempt: try candidates in order until one starts.
    ///
    /// Returns `Ok` when a strategy has handed control to an external flow;
    /// the result arrives later via [`Self::on_agent_result`]. Fails with the
    /// aggregate login error when no candidate could start.
    pub fn start(&mut self, request: AuthorizationRequest) -> Result<(), AuthError> {
        let candidates = StrategyKind::candidates_for(&request);
        self.pending = Some(PendingAttempt {
            request,
            candidates,
            current: None,
            unvalidated_token: None,
        });
        self.try_next_strategy()
    }

    fn try_next_strategy(&mut self) -> Result<(), AuthError> {
        let Some(attempt) = self.pending.as_mut() else {
            return Err(AuthError::NoPendingRequest);
        };

        while !attempt.candidates.is_empty() {
            let kind = attempt.candidates.remove(0);
            match self.agent.start(kind, &attempt.request) {
                StartOutcome::Started => {
                    #[cfg(feature = "telemetry")]
                    tracing::debug!(strategy = ?kind, "authorization strategy started");
                    attempt.current = Some(kind);
                    return Ok(());
                }
                StartOutcome::NotTried(reason) => {
                    #[cfg(feature = "telemetry")]
                    tracing::debug!(strategy = ?kind, %reason, "authorization strategy skipped");
                    let _ = reason;
                }
            }
        }

        self.pending = None;
        Err(AuthError::NoStrategyStarted)
    }

    /// Cancel the in-flight strategy, if any.
    pub fn cancel(&mut self) {
        if let Some(attempt) = self.pending.take() {
            if let Some(kind) = attempt.current {
                self.agent.cancel(kind);
            }
        }
    }

    /// Feed the external result of the started strategy back in.
    pub fn on_agent_result(&mut self, result: AgentResult) -> Result<CoordinatorStep, AuthError> {
        let Some(attempt) = self.pending.as_mut() else {
            return Err(AuthError::NoPendingRequest);
        };
        let Some(kind) = attempt.current.take() else {
            return Err(AuthError::NoPendingRequest);
        };

        match result {
            AgentResult::NeedsRestart => match self.try_next_strategy() {
                Ok(()) => Ok(CoordinatorStep::Pending),
                Err(AuthError::NoStrategyStarted) => Ok(CoordinatorStep::Completed(
                    AuthOutcome::Error(AuthError::NoStrategyStarted),
                )),
                Err(e) => Err(e),
            },
            AgentResult::Cancelled(message) => {
                self.pending = None;
                Ok(CoordinatorStep::Completed(AuthOutcome::Cancelled(message)))
            }
            AgentResult::Failed {
                error_type,
                description,
                code,
            } => {
                self.pending = None;
                Ok(CoordinatorStep::Completed(AuthOutcome::Error(
                    AuthError::Agent {
                        error_type,
                        description,
                        code,
                    },
                )))
            }
            AgentResult::Granted(bundle) => {
                let token = AccessToken::from_web_bundle(
                    attempt.request.permissions(),
                    &bundle,
                    kind.token_source(),
                );
                if token.is_invalid() {
                    self.pending = None;
                    return Ok(CoordinatorStep::Completed(AuthOutcome::Error(
                        AuthError::InvalidToken,
                    )));
                }

                match attempt.request.previous_token().cloned() {
                    Some(previous) if !previous.is_invalid() => {
                        let batch = build_revalidation_batch(
                            attempt.request.application_id(),
                            &previous,
                            &token,
                        );
                        attempt.unvalidated_token = Some(token);
                        Ok(CoordinatorStep::Validate(batch))
                    }
                    _ => {
                        self.pending = None;
                        Ok(CoordinatorStep::Completed(AuthOutcome::Success(token)))
                    }
                }
            }
        }
    }

    /// Resolve a pending same-user validation from the batch responses,
    /// ordered as the validation batch was built: old-token identity,
    /// new-token identity, new-token permissions.
    pub fn on_validation_responses(&mut self, responses: &[Response]) -> AuthOutcome {
        let Some(attempt) = self.pending.take() else {
            return AuthOutcome::Error(AuthError::NoPendingRequest);
        };
        let Some(token) = attempt.unvalidated_token else {
            return AuthOutcome::Error(AuthError::NoPendingRequest);
        };

        let [previous_me, current_me, permissions] = responses else {
            return AuthOutcome::Error(AuthError::InvalidToken);
        };

        let previous_id = user_id(previous_me);
        let current_id = user_id(current_me);
        match (previous_id, current_id) {
            (Some(previous), Some(current)) if previous == current => {}
            (Some(_), Some(_)) => return AuthOutcome::Error(AuthError::DifferentUser),
            _ => return AuthOutcome::Error(AuthError::InvalidToken),
        }

        let (granted, declined) = permission_lists(permissions);
        AuthOutcome::Success(token.with_refreshed_permissions(granted, declined))
    }
}

/// Three verification calls proving the new token belongs to the same user
/// and refreshing the granted permission list.
fn build_revalidation_batch(
    application_id: &str,
    previous: &AccessToken,
    new_token: &AccessToken,
) -> RequestBatch {
    let mut batch = RequestBatch::new(vec![
        identity_request(previous.token()),
        identity_request(new_token.token()),
        permissions_request(new_token.token()),
    ]);
    batch.set_batch_application_id(application_id);
    batch
}

fn identity_request(token: &str) -> Request {
    let mut request = Request::new(None, crate::graph::request::ME_PATH, HttpMethod::Get);
    request.set_parameter("fields", "id");
    request.set_parameter(crate::graph::request::ACCESS_TOKEN_PARAM, token);
    request
}

fn permissions_request(token: &str) -> Request {
    let mut request = Request::new(
        None,
        crate::graph::request::MY_PERMISSIONS_PATH,
        HttpMethod::Get,
    );
    request.set_parameter(crate::graph::request::ACCESS_TOKEN_PARAM, token);
    request
}

fn user_id(response: &Response) -> Option<String> {
    response
        .graph_object()?
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Split a `me/permissions` response into granted and declined lists.
fn permission_lists(response: &Response) -> (Vec<String>, Vec<String>) {
    let mut granted = Vec::new();
    let mut declined = Vec::new();

    let data = response
        .graph_object()
        .and_then(|o| o.get("data"))
        .and_then(Value::as_array);
    if let Some(entries) = data {
        for entry in entries {
            let Some(name) = entry.get("permission").and_then(Value::as_str) else {
                continue;
            };
            match entry.get("status").and_then(Value::as_str) {
                Some("granted") => granted.push(name.to_string()),
                Some("declined") => declined.push(name.to_string()),
                _ => {}
            }
        }
    }
    (granted, declined)
}
