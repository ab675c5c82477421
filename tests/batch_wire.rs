// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire-format tests: batch serialization, attachment hoisting, response
//! demultiplexing, and session side effects of remote errors.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;

use graphkit::graph::{responses_from_body, HttpMethod, Request, RequestBatch, MIME_BOUNDARY};
use graphkit::session::{Session, SessionState};
use graphkit::token::{AccessToken, AccessTokenSource, MemoryTokenStore, TokenStore};
use graphkit::LoginBehavior;

fn open_session(application_id: &str, token: &str) -> Session {
    let store = Arc::new(MemoryTokenStore::new());
    let cached = AccessToken::from_existing(
        token,
        Some(Utc::now() + Duration::hours(2)),
        Some(Utc::now()),
        Some(AccessTokenSource::AppWeb),
        std::iter::empty::<String>(),
    );
    store.save(&cached.to_cache_bundle()).unwrap();

    let session = Session::new(application_id, store, None);
    session
        .open_for_read(vec![], LoginBehavior::default())
        .unwrap();
    session
}

fn body_text(body: &Option<Vec<u8>>) -> String {
    String::from_utf8_lossy(body.as_deref().unwrap_or_default()).to_string()
}

fn extract_batch_json(body: &str) -> Value {
    let marker = "name=\"batch\"\r\n\r\n";
    let start = body.find(marker).expect("batch part present") + marker.len();
    let end = body[start..].find("\r\n").unwrap() + start;
    serde_json::from_str(&body[start..end]).expect("batch JSON parses")
}

// ============================================================================
// Serialization
// ============================================================================

#[test]
fn test_attachments_hoisted_across_batch() {
    let mut batch = RequestBatch::new(vec![]);
    batch.set_batch_application_id("app-w1");

    let mut first = Request::new(None, "me/photos", HttpMethod::Post);
    first.set_attachment("source", "one.jpg", "image/jpeg", vec![1, 1, 1]);
    batch.push(first);

    batch.push(Request::new(None, "me", HttpMethod::Get));

    let mut third = Request::new(None, "me/photos", HttpMethod::Post);
    third.set_attachment("source", "two.jpg", "image/jpeg", vec![2, 2, 2]);
    batch.push(third);

    let wire = batch.to_wire_request().unwrap();
    let body = body_text(&wire.body);

    // Exactly two file parts, numbered across the whole batch.
    assert_eq!(body.matches("name=\"file0\"").count(), 1);
    assert_eq!(body.matches("name=\"file1\"").count(), 1);
    assert!(!body.contains("name=\"file2\""));

    // Each file is referenced by exactly one entry.
    let entries_json = extract_batch_json(&body);
    let entries = entries_json.as_array().unwrap();
    assert_eq!(entries[0]["attached_files"], "file0");
    assert!(entries[1].get("attached_files").is_none());
    assert_eq!(entries[2]["attached_files"], "file1");
}

#[test]
fn test_single_get_and_batch_of_one_serialize_identically() {
    let mut request = Request::new(None, "me", HttpMethod::Get);
    request.set_parameter("fields", "id,name");

    let direct = RequestBatch::from_request(request.clone())
        .to_wire_request()
        .unwrap();
    let wrapped = RequestBatch::new(vec![request]).to_wire_request().unwrap();

    assert_eq!(direct, wrapped);
    assert_eq!(direct.method, HttpMethod::Get);
    assert!(direct.body.is_none());
    assert!(direct.url.contains("fields=id%2Cname"));
}

#[test]
fn test_session_token_rides_in_relative_url() {
    let session = open_session("app-w2", "session-token");
    let mut batch = RequestBatch::new(vec![
        Request::new(Some(session.clone()), "me", HttpMethod::Get),
        Request::new(None, "app-w2", HttpMethod::Get),
    ]);
    batch.set_batch_application_id("app-w2");

    let wire = batch.to_wire_request().unwrap();
    assert!(wire
        .headers
        .iter()
        .any(|(k, v)| k == "Content-Type" && v.contains(MIME_BOUNDARY)));

    let entries_json = extract_batch_json(&body_text(&wire.body));
    let entries = entries_json.as_array().unwrap();
    let first_url = entries[0]["relative_url"].as_str().unwrap();
    assert!(first_url.contains("access_token=session-token"));
    // The sessionless sibling carries no session token.
    let second_url = entries[1]["relative_url"].as_str().unwrap();
    assert!(!second_url.contains("session-token"));
}

#[test]
fn test_batch_application_id_from_first_open_session() {
    let session = open_session("app-from-session", "tok");
    let batch = RequestBatch::new(vec![
        Request::new(None, "me", HttpMethod::Get),
        Request::new(Some(session), "me", HttpMethod::Get),
    ]);
    assert_eq!(
        batch.resolve_batch_application_id().unwrap(),
        "app-from-session"
    );
}

#[test]
fn test_unopened_bound_session_is_a_fault() {
    let session = Session::new("app-w3", Arc::new(MemoryTokenStore::new()), None);
    assert_eq!(session.state(), SessionState::Created);

    let mut batch = RequestBatch::from_request(Request::new(Some(session), "me", HttpMethod::Get));
    batch.set_batch_application_id("app-w3");
    assert!(batch.to_wire_request().is_err());
}

// ============================================================================
// Demultiplexing
// ============================================================================

#[test]
fn test_count_mismatch_fails_whole_batch() {
    let mut batch = RequestBatch::new(vec![
        Request::new(None, "me", HttpMethod::Get),
        Request::new(None, "me/friends", HttpMethod::Get),
        Request::new(None, "me/likes", HttpMethod::Get),
    ]);
    batch.set_batch_application_id("app-w4");

    // Two elements for three requests: no partial success is invented.
    let body = r#"[{"code":200,"body":"{}"},{"code":200,"body":"{}"}]"#;
    let responses = responses_from_body(&batch, 200, body);

    assert_eq!(responses.len(), 3);
    assert!(responses.iter().all(|r| !r.is_success()));
}

#[test]
fn test_invalid_token_error_clears_bound_session() {
    let session = open_session("app-w5", "doomed-token");

    let mut batch = RequestBatch::new(vec![
        Request::new(Some(session.clone()), "me", HttpMethod::Get),
        Request::new(None, "app-w5", HttpMethod::Get),
    ]);
    batch.set_batch_application_id("app-w5");

    let body = r#"[
        {"code": 400, "body": "{\"error\":{\"code\":190,\"message\":\"expired\"}}"},
        {"code": 200, "body": "{\"id\":\"app-w5\"}"}
    ]"#;
    let responses = responses_from_body(&batch, 200, body);

    // The sibling request still succeeded.
    assert!(responses[1].is_success());
    // The failing request's session lost its credential.
    assert!(session.is_closed());
    assert!(session.access_token().is_invalid());
}
