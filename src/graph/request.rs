// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Description of a single graph API call.
//!
//! A [`Request`] names a graph path, an HTTP method, a parameter map, and
//! optionally a bound [`Session`], a structured-object payload, batch-entry
//! metadata, and a completion callback. Requests stay mutable until they are
//! handed to the batch serializer, which reads a snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config;
use crate::error::GraphError;
use crate::session::Session;

use super::response::Response;

/// Parameter key carrying the access token.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";
/// Parameter key identifying the calling SDK.
pub const SDK_PARAM: &str = "sdk";
/// Value of [`SDK_PARAM`], added to every request.
pub const SDK_VALUE: &str = "rust";
/// Parameter key selecting the response format.
pub const FORMAT_PARAM: &str = "format";
/// Value of [`FORMAT_PARAM`], added to every request.
pub const FORMAT_JSON: &str = "json";

/// Graph path of the "me" node.
pub const ME_PATH: &str = "me";
/// Graph edge listing the current user's granted permissions.
pub const MY_PERMISSIONS_PATH: &str = "me/permissions";

static VERSIONED_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/?v\d+\.\d+/").expect("valid version pattern"));

/// HTTP methods the graph endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// A binary payload serialized as a named multipart file part.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("bytes", &format!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

/// A single request parameter.
///
/// Scalar values can travel in a query string; attachments can only travel in
/// a multipart body, so they are rejected on GET requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Attachment(Attachment),
}

impl ParameterValue {
    /// Render a scalar parameter as its wire string; `None` for attachments.
    pub fn as_query_value(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Integer(n) => Some(n.to_string()),
            Self::Boolean(b) => Some(b.to_string()),
            Self::Date(d) => Some(d.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Self::Attachment(_) => None,
        }
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self, Self::Attachment(_))
    }
}

impl From<&str> for ParameterValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for ParameterValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for ParameterValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Completion callback, invoked once with the demultiplexed outcome.
pub type RequestCallback = Arc<dyn Fn(&Response) + Send + Sync>;

/// Upload progress callback: `(bytes_written, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// One graph API call, possibly part of a batch.
#[derive(Clone, Default)]
pub struct Request {
    session: Option<Session>,
    path: String,
    method: HttpMethod,
    parameters: BTreeMap<String, ParameterValue>,
    graph_object: Option<Value>,
    batch_entry_name: Option<String>,
    depends_on: Option<String>,
    omit_response_on_success: bool,
    callback: Option<RequestCallback>,
    progress_callback: Option<ProgressCallback>,
}

impl Request {
    pub fn new(session: Option<Session>, path: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            session,
            path: path.into(),
            method,
            ..Default::default()
        }
    }

    /// GET request for the current user's profile.
    pub fn new_me_request(session: Session) -> Self {
        Self::new(Some(session), ME_PATH, HttpMethod::Get)
    }

    /// GET request for the current user's granted permissions.
    pub fn new_my_permissions_request(session: Session) -> Self {
        Self::new(Some(session), MY_PERMISSIONS_PATH, HttpMethod::Get)
    }

    /// POST request creating a graph object under `path`.
    pub fn new_post_request(session: Option<Session>, path: impl Into<String>, object: Value) -> Self {
        let mut request = Self::new(session, path, HttpMethod::Post);
        request.graph_object = Some(object);
        request
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: Option<Session>) {
        self.session = session;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn set_method(&mut self, method: HttpMethod) {
        self.method = method;
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParameterValue> {
        &self.parameters
    }

    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<ParameterValue>) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn set_attachment(
        &mut self,
        key: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) {
        self.parameters.insert(
            key.into(),
            ParameterValue::Attachment(Attachment {
                filename: filename.into(),
                content_type: content_type.into(),
                bytes,
            }),
        );
    }

    pub fn graph_object(&self) -> Option<&Value> {
        self.graph_object.as_ref()
    }

    pub fn set_graph_object(&mut self, object: Value) {
        self.graph_object = Some(object);
    }

    /// Name this entry so later batch entries can depend on it.
    pub fn set_batch_entry_name(&mut self, name: impl Into<String>) {
        self.batch_entry_name = Some(name.into());
    }

    pub fn batch_entry_name(&self) -> Option<&str> {
        self.batch_entry_name.as_deref()
    }

    /// Reference a named earlier entry whose result this entry consumes.
    pub fn set_depends_on(&mut self, name: impl Into<String>) {
        self.depends_on = Some(name.into());
    }

    pub fn depends_on(&self) -> Option<&str> {
        self.depends_on.as_deref()
    }

    pub fn set_omit_response_on_success(&mut self, omit: bool) {
        self.omit_response_on_success = omit;
    }

    pub fn omit_response_on_success(&self) -> bool {
        self.omit_response_on_success
    }

    pub fn set_callback(&mut self, callback: RequestCallback) {
        self.callback = Some(callback);
    }

    pub fn callback(&self) -> Option<&RequestCallback> {
        self.callback.as_ref()
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    pub fn progress_callback(&self) -> Option<&ProgressCallback> {
        self.progress_callback.as_ref()
    }

    /// The path with a version segment, prepending the default API version
    /// unless the caller already supplied one.
    pub fn versioned_path(&self) -> String {
        let trimmed = self.path.trim_start_matches('/');
        if VERSIONED_PATH.is_match(&self.path) {
            trimmed.to_string()
        } else {
            format!("{}/{}", config::api_version(), trimmed)
        }
    }

    /// Resolve the token this request travels with, if any.
    ///
    /// A bound session must be opened; a sessionless request falls back to the
    /// app-scoped `appId|clientToken` credential when both halves are
    /// configured, and is otherwise sent anonymously.
    pub fn resolve_access_token(&self) -> Result<Option<String>, GraphError> {
        if let Some(session) = &self.session {
            if !session.is_opened() {
                return Err(GraphError::SessionNotOpened);
            }
            return Ok(Some(session.access_token().token().to_string()));
        }

        if self.parameters.contains_key(ACCESS_TOKEN_PARAM) {
            return Ok(None);
        }

        match (config::application_id(), config::client_token()) {
            (Some(app_id), Some(client_token)) => Ok(Some(format!("{app_id}|{client_token}"))),
            _ => Ok(None),
        }
    }

    /// The parameter snapshot the serializer writes: caller parameters plus
    /// the resolved token and the fixed SDK identification fields.
    pub fn wire_parameters(&self) -> Result<BTreeMap<String, ParameterValue>, GraphError> {
        let mut params = self.parameters.clone();

        if let Some(token) = self.resolve_access_token()? {
            params.insert(ACCESS_TOKEN_PARAM.to_string(), ParameterValue::Text(token));
        }
        params.insert(SDK_PARAM.to_string(), ParameterValue::Text(SDK_VALUE.to_string()));
        params.insert(
            FORMAT_PARAM.to_string(),
            ParameterValue::Text(FORMAT_JSON.to_string()),
        );

        Ok(params)
    }

    /// Serialize the structured-object payload into flat key=value body pairs.
    ///
    /// Object-valued properties are passed by reference (their `id` or `url`
    /// field); the exception is the `image` property of an Open Graph action
    /// call, which is expanded by value because the endpoint needs the actual
    /// image metadata.
    pub fn graph_object_key_values(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let Some(Value::Object(object)) = &self.graph_object else {
            return pairs;
        };

        let pass_image_by_value = is_og_action_path(&self.path);
        for (key, value) in object {
            let by_value = pass_image_by_value && key.eq_ignore_ascii_case("image");
            flatten_property(key, value, by_value, &mut pairs);
        }
        pairs
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .field("batch_entry_name", &self.batch_entry_name)
            .finish()
    }
}

/// Whether a path names an Open Graph action (`me/<namespace>:<verb>`).
fn is_og_action_path(path: &str) -> bool {
    let trimmed = path.trim_start_matches('/');
    let Some(rest) = trimmed.strip_prefix("me/") else {
        return false;
    };
    let action = rest.split('/').next().unwrap_or("");
    action.contains(':')
}

/// Flatten one graph-object property into `key=value` pairs.
///
/// `by_value` forces nested expansion (`key[sub]=...`, `key[0]=...`) instead
/// of reference flattening.
fn flatten_property(key: &str, value: &Value, by_value: bool, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            if !by_value {
                if let Some(id) = map.get("id").and_then(Value::as_str) {
                    out.push((key.to_string(), id.to_string()));
                    return;
                }
                if let Some(url) = map.get("url").and_then(Value::as_str) {
                    out.push((key.to_string(), url.to_string()));
                    return;
                }
            }
            for (sub_key, sub_value) in map {
                flatten_property(&format!("{key}[{sub_key}]"), sub_value, by_value, out);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_property(&format!("{key}[{index}]"), item, by_value, out);
            }
        }
        Value::String(s) => out.push((key.to_string(), s.clone())),
        Value::Number(n) => out.push((key.to_string(), n.to_string())),
        Value::Bool(b) => out.push((key.to_string(), b.to_string())),
        Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_prefix_added_when_missing() {
        let request = Request::new(None, "me/friends", HttpMethod::Get);
        assert_eq!(
            request.versioned_path(),
            format!("{}/me/friends", config::api_version())
        );
    }

    #[test]
    fn test_existing_version_prefix_untouched() {
        let request = Request::new(None, "v1.0/me/friends", HttpMethod::Get);
        assert_eq!(request.versioned_path(), "v1.0/me/friends");

        let leading_slash = Request::new(None, "/v3.1/me", HttpMethod::Get);
        assert_eq!(leading_slash.versioned_path(), "v3.1/me");
    }

    #[test]
    fn test_wire_parameters_add_sdk_fields() {
        let request = Request::new(None, "me", HttpMethod::Get);
        let params = request.wire_parameters().unwrap();
        assert_eq!(
            params.get(SDK_PARAM),
            Some(&ParameterValue::Text(SDK_VALUE.to_string()))
        );
        assert_eq!(
            params.get(FORMAT_PARAM),
            Some(&ParameterValue::Text(FORMAT_JSON.to_string()))
        );
    }

    #[test]
    fn test_graph_object_pass_by_reference() {
        let mut request = Request::new(None, "me/feed", HttpMethod::Post);
        request.set_graph_object(json!({
            "message": "hello",
            "place": {"id": "12345", "name": "Somewhere"}
        }));

        let pairs = request.graph_object_key_values();
        assert!(pairs.contains(&("message".to_string(), "hello".to_string())));
        assert!(pairs.contains(&("place".to_string(), "12345".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k.starts_with("place[")));
    }

    #[test]
    fn test_og_action_image_passed_by_value() {
        let mut request = Request::new(None, "me/cookbook:eat", HttpMethod::Post);
        request.set_graph_object(json!({
            "meal": {"id": "987"},
            "image": [{"url": "http://example.com/pic.jpg", "user_generated": true}]
        }));

        let pairs = request.graph_object_key_values();
        assert!(pairs.contains(&("meal".to_string(), "987".to_string())));
        assert!(pairs.contains(&(
            "image[0][url]".to_string(),
            "http://example.com/pic.jpg".to_string()
        )));
        assert!(pairs.contains(&("image[0][user_generated]".to_string(), "true".to_string())));
        assert!(!pairs.contains(&("image".to_string(), "http://example.com/pic.jpg".to_string())));
    }

    #[test]
    fn test_non_action_image_stays_by_reference() {
        let mut request = Request::new(None, "me/photos", HttpMethod::Post);
        request.set_graph_object(json!({"image": {"url": "http://example.com/pic.jpg"}}));

        let pairs = request.graph_object_key_values();
        assert!(pairs.contains(&("image".to_string(), "http://example.com/pic.jpg".to_string())));
    }

    #[test]
    fn test_og_action_path_detection() {
        assert!(is_og_action_path("me/cookbook:eat"));
        assert!(is_og_action_path("/me/ns:verb/extra"));
        assert!(!is_og_action_path("me/feed"));
        assert!(!is_og_action_path("someuser/cookbook:eat"));
    }

    #[test]
    fn test_attachment_not_a_query_value() {
        let value = ParameterValue::Attachment(Attachment {
            filename: "pic.png".to_string(),
            content_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        });
        assert!(value.as_query_value().is_none());
        assert!(value.is_attachment());
    }
}
