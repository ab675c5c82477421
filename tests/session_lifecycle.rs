// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end session lifecycle tests: cached-token fast paths, terminal
//! states, and background token extension.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};

use graphkit::auth::{AuthorizationRequest, StartOutcome, StrategyKind};
use graphkit::session::{AuthContinuation, Session, SessionState};
use graphkit::token::{
    AccessToken, AccessTokenSource, AuthBundle, MemoryTokenStore, TokenStore, ACCESS_TOKEN_KEY,
    EXPIRES_IN_KEY,
};
use graphkit::{AgentResult, AuthAgent, LoginBehavior};

// ============================================================================
// Test agents
// ============================================================================

/// Agent that starts every strategy and answers every refresh.
struct ObligingAgent {
    refresh_bundle: Option<AuthBundle>,
    starts: Mutex<Vec<StrategyKind>>,
}

impl ObligingAgent {
    fn new() -> Self {
        Self {
            refresh_bundle: None,
            starts: Mutex::new(Vec::new()),
        }
    }

    fn with_refresh(token: &str, expires_at_epoch: i64) -> Self {
        let mut bundle = AuthBundle::new();
        bundle.insert(ACCESS_TOKEN_KEY.to_string(), token.to_string());
        bundle.insert(EXPIRES_IN_KEY.to_string(), expires_at_epoch.to_string());
        Self {
            refresh_bundle: Some(bundle),
            starts: Mutex::new(Vec::new()),
        }
    }
}

impl AuthAgent for ObligingAgent {
    fn start(&self, kind: StrategyKind, _request: &AuthorizationRequest) -> StartOutcome {
        self.starts.lock().unwrap().push(kind);
        StartOutcome::Started
    }

    fn refresh_token(&self, _current_token: &str) -> Option<AuthBundle> {
        self.refresh_bundle.clone()
    }
}

fn store_with_token(
    token: &str,
    permissions: &[&str],
    expires_in: Duration,
    last_refresh_ago: Duration,
) -> Arc<MemoryTokenStore> {
    let store = Arc::new(MemoryTokenStore::new());
    let token = AccessToken::from_existing(
        token,
        Some(Utc::now() + expires_in),
        Some(Utc::now() - last_refresh_ago),
        Some(AccessTokenSource::AppWeb),
        permissions.iter().map(|p| p.to_string()),
    );
    store.save(&token.to_cache_bundle()).unwrap();
    store
}

// ============================================================================
// Opening
// ============================================================================

#[test]
fn test_cached_subset_opens_without_authorization() {
    let agent = Arc::new(ObligingAgent::new());
    let store = store_with_token("cached", &["a", "b", "c"], Duration::hours(2), Duration::zero());
    let session = Session::new("app-1", store, Some(agent.clone()));

    assert_eq!(session.state(), SessionState::CreatedTokenLoaded);
    session
        .open_for_read(vec!["a".to_string(), "b".to_string()], LoginBehavior::default())
        .unwrap();

    assert_eq!(session.state(), SessionState::Opened);
    // The authorization coordinator was never consulted.
    assert!(agent.starts.lock().unwrap().is_empty());
}

#[test]
fn test_full_login_flow_persists_token() {
    let store = Arc::new(MemoryTokenStore::new());
    let session = Session::new("app-1", store.clone(), Some(Arc::new(ObligingAgent::new())));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    session.add_state_change_observer(Arc::new(move |_, state, _| {
        sink.lock().unwrap().push(state);
    }));

    session
        .open_for_read(vec!["email".to_string()], LoginBehavior::default())
        .unwrap();
    assert_eq!(session.state(), SessionState::Opening);

    let mut bundle = AuthBundle::new();
    bundle.insert(ACCESS_TOKEN_KEY.to_string(), "fresh".to_string());
    bundle.insert(EXPIRES_IN_KEY.to_string(), "3600".to_string());
    match session.continue_authorization(AgentResult::Granted(bundle)).unwrap() {
        AuthContinuation::Done => {}
        AuthContinuation::ValidationRequired(_) => panic!("first login needs no validation"),
    }

    assert_eq!(session.state(), SessionState::Opened);
    assert_eq!(session.access_token().token(), "fresh");
    assert_eq!(
        *observed.lock().unwrap(),
        vec![SessionState::Opening, SessionState::Opened]
    );

    let saved = store.load().unwrap().expect("token persisted on success");
    assert_eq!(saved.token, "fresh");
}

// ============================================================================
// Terminal states
// ============================================================================

#[test]
fn test_terminal_states_reject_everything() {
    let store = store_with_token("cached", &["email"], Duration::hours(2), Duration::zero());
    let session = Session::new("app-1", store, Some(Arc::new(ObligingAgent::new())));
    session.open_for_read(vec![], LoginBehavior::default()).unwrap();
    session.close();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(session
        .open_for_read(vec![], LoginBehavior::default())
        .is_err());
    assert!(session
        .open_for_publish(vec!["publish_actions".to_string()], LoginBehavior::default())
        .is_err());
    assert!(session
        .request_new_read_permissions(vec!["email".to_string()], LoginBehavior::default())
        .is_err());
    // And the state did not move.
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_aborted_login_is_closed_login_failed() {
    let session = Session::new(
        "app-1",
        Arc::new(MemoryTokenStore::new()),
        Some(Arc::new(ObligingAgent::new())),
    );
    session.open_for_read(vec![], LoginBehavior::default()).unwrap();
    assert_eq!(session.state(), SessionState::Opening);

    session.close();
    assert_eq!(session.state(), SessionState::ClosedLoginFailed);
    assert!(session.access_token().is_invalid());
}

// ============================================================================
// Token extension
// ============================================================================

#[test]
fn test_stale_token_extends_after_request_activity() {
    // Cached token: still valid but refreshed two days ago.
    let store = store_with_token("stale", &["email"], Duration::seconds(10), Duration::days(2));
    let new_expiry = (Utc::now() + Duration::days(60)).timestamp();
    let agent = Arc::new(ObligingAgent::with_refresh("extended", new_expiry));
    let session = Session::new("app-1", store.clone(), Some(agent));

    session.open_for_read(vec![], LoginBehavior::default()).unwrap();
    assert_eq!(session.state(), SessionState::Opened);
    assert!(session.should_extend_access_token());

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    session.add_state_change_observer(Arc::new(move |_, state, _| {
        sink.lock().unwrap().push(state);
    }));

    // What the request pipeline does after every batch.
    session.extend_access_token_if_needed();

    assert_eq!(session.state(), SessionState::OpenedTokenUpdated);
    assert_eq!(session.access_token().token(), "extended");
    assert_eq!(
        *observed.lock().unwrap(),
        vec![SessionState::OpenedTokenUpdated]
    );

    // The new expiry reached the store.
    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.token, "extended");
    assert!(saved.expires_at > (Utc::now() + Duration::days(30)).timestamp_millis());

    // The retry cooldown blocks an immediate second attempt.
    assert!(!session.should_extend_access_token());
}

#[test]
fn test_failed_extension_keeps_current_token() {
    let store = store_with_token("stale", &["email"], Duration::hours(1), Duration::days(2));
    // Agent with no refresh channel.
    let session = Session::new("app-1", store, Some(Arc::new(ObligingAgent::new())));
    session.open_for_read(vec![], LoginBehavior::default()).unwrap();

    session.extend_access_token_if_needed();

    // Extension is advisory: the session carries on with the old token.
    assert_eq!(session.state(), SessionState::Opened);
    assert_eq!(session.access_token().token(), "stale");
}

#[test]
fn test_webview_tokens_never_extend() {
    let store = Arc::new(MemoryTokenStore::new());
    let token = AccessToken::from_existing(
        "webview",
        Some(Utc::now() + Duration::hours(1)),
        Some(Utc::now() - Duration::days(2)),
        Some(AccessTokenSource::WebView),
        std::iter::empty::<String>(),
    );
    store.save(&token.to_cache_bundle()).unwrap();

    let session = Session::new("app-1", store, None);
    session.open_for_read(vec![], LoginBehavior::default()).unwrap();
    assert!(!session.should_extend_access_token());
}
