// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Authorization strategies and the agent seam that runs them.
//!
//! Each strategy is one concrete mechanism for obtaining a credential. The
//! SDK does not render UI itself; the host supplies an [`AuthAgent`] that
//! knows how to launch each mechanism and later feeds the external result
//! back to the coordinator.

use crate::token::{AccessTokenSource, AuthBundle};

use super::request::AuthorizationRequest;

/// The concrete mechanisms a coordinator can try, in no particular order;
/// ordering comes from the request's login behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Silent token fetch from the platform app's background service.
    NativeService,
    /// Hand-off to the platform app's native login screen.
    NativeApp,
    /// Proxied login through the platform app on behalf of another app.
    Proxy,
    /// SDK-hosted web view login dialog.
    WebView,
}

impl StrategyKind {
    /// The token source recorded on credentials this strategy produces.
    pub fn token_source(&self) -> AccessTokenSource {
        match self {
            Self::NativeService => AccessTokenSource::AppService,
            Self::NativeApp => AccessTokenSource::AppNative,
            Self::Proxy => AccessTokenSource::AppWeb,
            Self::WebView => AccessTokenSource::WebView,
        }
    }

    /// Candidate list for a request, filtered by its login behavior and
    /// ordered most-preferred first.
    pub fn candidates_for(request: &AuthorizationRequest) -> Vec<StrategyKind> {
        let behavior = request.behavior();
        let mut kinds = Vec::new();
        if behavior.allows_native() {
            kinds.push(Self::NativeService);
            kinds.push(Self::NativeApp);
            kinds.push(Self::Proxy);
        }
        if behavior.allows_web_view() {
            kinds.push(Self::WebView);
        }
        kinds
    }
}

/// What happened when the agent was asked to start a strategy.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// Control was handed to an external UI/process; a result will arrive
    /// later through the coordinator.
    Started,
    /// The strategy could not be attempted (missing app, missing capability).
    /// The reason is logged and the next candidate is tried.
    NotTried(String),
}

/// Terminal result of a started strategy, as reported by the external flow.
#[derive(Debug, Clone)]
pub enum AgentResult {
    /// The flow produced a credential bundle.
    Granted(AuthBundle),
    /// The user backed out.
    Cancelled(String),
    /// The flow failed with a structured error.
    Failed {
        error_type: String,
        description: String,
        code: Option<i64>,
    },
    /// The started strategy turned out to be unusable (e.g. a disabled
    /// service); the coordinator should fall through to the next candidate.
    NeedsRestart,
}

/// Host-supplied collaborator that launches external authorization flows and
/// performs silent token refreshes.
///
/// Implementations must never panic out of `start`; an unworkable strategy is
/// reported as [`StartOutcome::NotTried`].
pub trait AuthAgent: Send + Sync {
    /// Attempt to launch one strategy for the given request.
    fn start(&self, kind: StrategyKind, request: &AuthorizationRequest) -> StartOutcome;

    /// Cancel a previously started strategy, if the mechanism supports it.
    fn cancel(&self, _kind: StrategyKind) {}

    /// Silently refresh a token through the platform service, returning the
    /// refresh bundle on success. The default agent has no such channel.
    fn refresh_token(&self, _current_token: &str) -> Option<AuthBundle> {
        None
    }
}
