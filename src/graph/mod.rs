// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Graph API request pipeline.
//!
//! Callers describe calls with [`Request`], group them with [`RequestBatch`],
//! and execute the batch as one HTTP round trip. Serialization
//! ([`RequestBatch::to_wire_request`]) and demultiplexing
//! ([`responses_from_body`]) are pure so the wire format is testable without
//! a network; [`execute_batch`] is the async glue between the two.
//!
//! Error routing: misuses of the API surface (empty batch, unopened bound
//! session) fail the call synchronously; everything that happens after the
//! request leaves the process — connection loss included — arrives through
//! the per-request [`Response`] channel instead.

pub mod batch;
pub mod error;
pub mod request;
pub mod response;

pub use batch::{BatchCallback, RequestBatch, WireRequest, MAXIMUM_BATCH_SIZE, MIME_BOUNDARY};
pub use error::{Category, RequestError};
pub use request::{
    Attachment, HttpMethod, ParameterValue, ProgressCallback, Request, RequestCallback,
};
pub use response::{responses_from_body, Response, NON_JSON_RESPONSE_PROPERTY};

use std::time::Duration;

use crate::config;
use crate::error::GraphError;

/// Network timeout applied when the batch does not set its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Execute a batch as one HTTP call and demultiplex the results.
///
/// Per-request callbacks fire in request order, then batch-completion
/// callbacks, on the delivery runtime of the batch when one is set and inline
/// otherwise; then every distinct bound session is given a chance to extend
/// its token. The returned `Err` covers only serialization-time caller
/// faults; network and remote failures are delivered inside the responses.
pub async fn execute_batch(
    client: &reqwest::Client,
    batch: &RequestBatch,
) -> Result<Vec<Response>, GraphError> {
    let wire = batch.to_wire_request()?;
    let responses = match send(client, &wire, batch.timeout().unwrap_or(DEFAULT_TIMEOUT)).await {
        Ok((status, body)) => responses_from_body(batch, status, &body),
        Err(e) => {
            #[cfg(feature = "telemetry")]
            tracing::warn!(error = %e, url = %wire.url, "graph call failed");
            response::uniform_failure(batch, RequestError::client(e.to_string()))
        }
    };

    deliver_callbacks(batch, &responses);

    // Advisory background maintenance, independent of call outcomes.
    for session in batch.sessions() {
        session.extend_access_token_if_needed();
    }

    Ok(responses)
}

/// Convenience wrapper for a batch of one.
pub async fn execute_request(
    client: &reqwest::Client,
    request: Request,
) -> Result<Response, GraphError> {
    let batch = RequestBatch::from_request(request);
    let mut responses = execute_batch(client, &batch).await?;
    // The count invariant guarantees exactly one response.
    responses
        .pop()
        .ok_or_else(|| GraphError::ResponseCountMismatch {
            expected: 1,
            actual: 0,
        })
}

/// Deliver callbacks on the batch's delivery runtime, falling back to the
/// process-wide handle, and finally to running them inline on the calling
/// thread when neither is configured.
pub fn deliver_callbacks(batch: &RequestBatch, responses: &[Response]) {
    let handle = batch
        .delivery_handle()
        .cloned()
        .or_else(config::callback_handle);
    match handle {
        Some(handle) => {
            let batch = batch.clone();
            let responses = responses.to_vec();
            let _ = handle.spawn(async move { dispatch_callbacks(&batch, &responses) });
        }
        None => dispatch_callbacks(batch, responses),
    }
}

/// Invoke per-request callbacks in request order, then batch callbacks.
pub fn dispatch_callbacks(batch: &RequestBatch, responses: &[Response]) {
    for (request, response) in batch.requests().iter().zip(responses) {
        if let Some(callback) = request.callback() {
            callback(response);
        }
    }
    for callback in batch.callbacks() {
        callback(responses);
    }
}

async fn send(
    client: &reqwest::Client,
    wire: &WireRequest,
    timeout: Duration,
) -> Result<(u16, String), reqwest::Error> {
    let method = match wire.method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Delete => reqwest::Method::DELETE,
    };

    let mut builder = client.request(method, &wire.url).timeout(timeout);
    for (name, value) in &wire.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &wire.body {
        builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok((status, body))
}
