// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Demultiplexing of wire responses back onto their requests.
//!
//! The endpoint answers a batch with a JSON array of per-request elements,
//! each carrying an embedded HTTP-style status and a body. A single request
//! answers with the bare body, which is wrapped into a synthetic one-element
//! array so the two cases share one code path. The output is always exactly
//! one [`Response`] per request, in request order.

use serde_json::{json, Value};

#[cfg(feature = "telemetry")]
use crate::config;
use crate::error::GraphError;

use super::batch::RequestBatch;
use super::error::RequestError;

/// Property name under which literal non-JSON results (`true`, numbers) are
/// wrapped so every success body is an object or a list.
pub const NON_JSON_RESPONSE_PROPERTY: &str = "NON_JSON_RESULT";

const CODE_KEY: &str = "code";
const BODY_KEY: &str = "body";

/// Outcome of one request: either a structured payload or an error.
#[derive(Debug, Clone)]
pub struct Response {
    graph_object: Option<Value>,
    graph_object_list: Option<Vec<Value>>,
    error: Option<RequestError>,
}

impl Response {
    pub(crate) fn success_object(object: Value) -> Self {
        Self {
            graph_object: Some(object),
            graph_object_list: None,
            error: None,
        }
    }

    pub(crate) fn success_list(list: Vec<Value>) -> Self {
        Self {
            graph_object: None,
            graph_object_list: Some(list),
            error: None,
        }
    }

    pub(crate) fn failure(error: RequestError) -> Self {
        Self {
            graph_object: None,
            graph_object_list: None,
            error: Some(error),
        }
    }

    pub fn graph_object(&self) -> Option<&Value> {
        self.graph_object.as_ref()
    }

    pub fn graph_object_list(&self) -> Option<&[Value]> {
        self.graph_object_list.as_deref()
    }

    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Turn a raw response body into one [`Response`] per request.
///
/// Protocol faults (unparseable body, array-length mismatch) fail the whole
/// batch uniformly; per-element errors stay local to their request, except
/// that an invalid-token error also clears the bound session's cached
/// credential.
pub fn responses_from_body(batch: &RequestBatch, status: u16, raw_body: &str) -> Vec<Response> {
    #[cfg(feature = "telemetry")]
    if config::is_logging_behavior_enabled(config::LoggingBehavior::IncludeRawResponses) {
        tracing::debug!(status, body = raw_body, "raw graph response");
    }

    let parsed: Value = match serde_json::from_str(raw_body) {
        Ok(value) => value,
        Err(e) => {
            return uniform_failure(batch, RequestError::client(format!("unparseable body: {e}")))
        }
    };

    let elements: Vec<Value> = if batch.len() == 1 {
        // Single requests answer with the bare body; synthesize the batch
        // framing so downstream logic is uniform.
        vec![json!({ CODE_KEY: status, BODY_KEY: parsed })]
    } else {
        match parsed {
            Value::Array(items) => items,
            // A top-level object in place of the array is an endpoint-level
            // error applied to every request.
            other => match RequestError::from_body(status, &other) {
                Some(error) => return uniform_failure(batch, error),
                None => {
                    return uniform_failure(
                        batch,
                        RequestError::client("expected response array"),
                    )
                }
            },
        }
    };

    if elements.len() != batch.len() {
        let fault = GraphError::ResponseCountMismatch {
            expected: batch.len(),
            actual: elements.len(),
        };
        return uniform_failure(batch, RequestError::client(fault.to_string()));
    }

    elements
        .into_iter()
        .zip(batch.requests())
        .map(|(element, request)| {
            let response = response_from_element(status, element);
            if let Some(error) = response.error() {
                if error.invalidates_token() {
                    if let Some(session) = request.session() {
                        session.close_and_clear_token_information();
                    }
                }
            }
            response
        })
        .collect()
}

/// The same error applied to every request in the batch.
pub fn uniform_failure(batch: &RequestBatch, error: RequestError) -> Vec<Response> {
    (0..batch.len()).map(|_| Response::failure(error.clone())).collect()
}

fn response_from_element(batch_status: u16, element: Value) -> Response {
    let Some(object) = element.as_object() else {
        return Response::failure(RequestError::client("malformed batch element"));
    };

    let status = object
        .get(CODE_KEY)
        .and_then(Value::as_u64)
        .map(|c| c as u16)
        .unwrap_or(batch_status);

    let body = match object.get(BODY_KEY) {
        // Batch elements carry the body as a JSON-encoded string.
        Some(Value::String(raw)) => match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => Value::String(raw.clone()),
        },
        Some(value) => value.clone(),
        None => {
            return Response::failure(RequestError::client("batch element missing body"));
        }
    };

    if let Some(error) = RequestError::from_body(status, &body) {
        return Response::failure(error);
    }

    match body {
        Value::Object(_) => Response::success_object(body),
        Value::Array(items) => Response::success_list(items),
        scalar => Response::success_object(json!({ NON_JSON_RESPONSE_PROPERTY: scalar })),
    }
}
