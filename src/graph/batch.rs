// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Batch assembly and wire serialization.
//!
//! One [`RequestBatch`] turns into exactly one HTTP call. A single non-POST
//! request degenerates to a query-string URL with no body; everything else is
//! a `multipart/form-data` POST. For true batches the parts are a `batch`
//! field holding a JSON array of per-request descriptors plus one `file<N>`
//! part per binary attachment hoisted out of the descriptors.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use url::form_urlencoded;

use crate::config;
use crate::error::GraphError;
use crate::session::Session;

use super::request::{Attachment, HttpMethod, ParameterValue, Request};
use super::response::Response;

/// Fixed multipart boundary; the endpoint does not require uniqueness.
pub const MIME_BOUNDARY: &str = "3i2ndDfv2rTHiSisAbouNdArYfORhtTPEefj3q2f";

/// Largest number of requests one batch may carry.
pub const MAXIMUM_BATCH_SIZE: usize = 50;

/// User-Agent prefix identifying the SDK.
pub const USER_AGENT_BASE: &str = "GraphKitSDK";

const BATCH_PARAM: &str = "batch";
const BATCH_APP_ID_PARAM: &str = "batch_app_id";
const ATTACHMENT_FILENAME_PREFIX: &str = "file";

/// Batch-completion callback, invoked after every per-request callback.
pub type BatchCallback = Arc<dyn Fn(&[Response]) + Send + Sync>;

/// Ordered, non-empty list of requests executed as one HTTP call.
#[derive(Clone, Default)]
pub struct RequestBatch {
    requests: Vec<Request>,
    batch_application_id: Option<String>,
    timeout: Option<Duration>,
    callbacks: Vec<BatchCallback>,
    delivery_handle: Option<Handle>,
}

impl RequestBatch {
    pub fn new(requests: Vec<Request>) -> Self {
        Self {
            requests,
            ..Default::default()
        }
    }

    pub fn from_request(request: Request) -> Self {
        Self::new(vec![request])
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn push(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Override the application id used for the batch envelope.
    pub fn set_batch_application_id(&mut self, id: impl Into<String>) {
        self.batch_application_id = Some(id.into());
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn add_callback(&mut self, callback: BatchCallback) {
        self.callbacks.push(callback);
    }

    pub fn callbacks(&self) -> &[BatchCallback] {
        &self.callbacks
    }

    /// Post this batch's completion callbacks to the given runtime instead of
    /// running them inline on the thread that drove the call.
    pub fn set_delivery_handle(&mut self, handle: Handle) {
        self.delivery_handle = Some(handle);
    }

    pub fn delivery_handle(&self) -> Option<&Handle> {
        self.delivery_handle.as_ref()
    }

    /// The distinct sessions bound to requests in this batch.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = Vec::new();
        for request in &self.requests {
            if let Some(session) = request.session() {
                if !sessions.iter().any(|s| s.same_session(session)) {
                    sessions.push(session.clone());
                }
            }
        }
        sessions
    }

    /// Resolve the application id the batch envelope travels with:
    /// explicit override, else the first open bound session's id, else the
    /// process-wide default.
    pub fn resolve_batch_application_id(&self) -> Result<String, GraphError> {
        if let Some(id) = &self.batch_application_id {
            return Ok(id.clone());
        }
        for request in &self.requests {
            if let Some(session) = request.session() {
                if session.is_opened() {
                    return Ok(session.application_id().to_string());
                }
            }
        }
        config::default_batch_application_id().ok_or(GraphError::MissingBatchApplicationId)
    }

    /// Serialize the batch into the single HTTP call it represents.
    pub fn to_wire_request(&self) -> Result<WireRequest, GraphError> {
        if self.requests.is_empty() {
            return Err(GraphError::EmptyBatch);
        }
        if self.requests.len() > MAXIMUM_BATCH_SIZE {
            return Err(GraphError::BatchTooLarge {
                size: self.requests.len(),
                max: MAXIMUM_BATCH_SIZE,
            });
        }

        #[cfg(feature = "telemetry")]
        if config::is_logging_behavior_enabled(config::LoggingBehavior::Requests) {
            tracing::debug!(requests = self.requests.len(), "serializing batch");
        }

        if self.requests.len() == 1 && self.requests[0].method() != HttpMethod::Post {
            return serialize_single_get(&self.requests[0]);
        }
        self.serialize_multipart()
    }

    fn serialize_multipart(&self) -> Result<WireRequest, GraphError> {
        let (url, write_body): (String, BodyWriter) = if self.requests.len() == 1 {
            let request = self.requests[0].clone();
            let url = format!(
                "{}/{}",
                config::settings().graph_base_url,
                request.versioned_path()
            );
            (url, Box::new(move |s| serialize_single_post(&request, s)))
        } else {
            let batch_app_id = self.resolve_batch_application_id()?;
            let requests = self.requests.clone();
            let url = config::settings().graph_base_url;
            (
                url,
                Box::new(move |s| serialize_batch(&requests, &batch_app_id, s)),
            )
        };

        let body = if self.has_progress_observer() {
            // Counting pass first, so progress reports know the total size.
            let mut counter = CountingWriter::default();
            {
                let mut serializer = Serializer::new(&mut counter);
                write_body(&mut serializer)?;
                serializer.finish()?;
            }
            let total = counter.written;

            let callbacks = self.progress_callbacks();
            let mut progress = ProgressWriter::new(
                Vec::new(),
                total,
                config::settings().progress_threshold_bytes,
                callbacks,
            );
            {
                let mut serializer = Serializer::new(&mut progress);
                write_body(&mut serializer)?;
                serializer.finish()?;
            }
            progress.complete()
        } else {
            let mut buffer = Vec::new();
            {
                let mut serializer = Serializer::new(&mut buffer);
                write_body(&mut serializer)?;
                serializer.finish()?;
            }
            buffer
        };

        Ok(WireRequest {
            url,
            method: HttpMethod::Post,
            headers: multipart_headers(),
            body: Some(body),
        })
    }

    fn has_progress_observer(&self) -> bool {
        self.requests.iter().any(|r| r.progress_callback().is_some())
    }

    fn progress_callbacks(&self) -> Vec<super::request::ProgressCallback> {
        self.requests
            .iter()
            .filter_map(|r| r.progress_callback().cloned())
            .collect()
    }
}

type BodyWriter = Box<dyn Fn(&mut Serializer<'_>) -> Result<(), GraphError>>;

/// The fully serialized form of a batch: one HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// User-Agent value sent on every call.
pub fn user_agent() -> String {
    format!("{USER_AGENT_BASE}.{}", env!("CARGO_PKG_VERSION"))
}

fn common_headers() -> Vec<(String, String)> {
    vec![
        ("User-Agent".to_string(), user_agent()),
        ("Accept-Language".to_string(), "en_US".to_string()),
    ]
}

fn multipart_headers() -> Vec<(String, String)> {
    let mut headers = common_headers();
    headers.push((
        "Content-Type".to_string(),
        format!("multipart/form-data; boundary={MIME_BOUNDARY}"),
    ));
    headers
}

fn serialize_single_get(request: &Request) -> Result<WireRequest, GraphError> {
    let params = request.wire_parameters()?;

    let mut query = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &params {
        match value.as_query_value() {
            Some(v) => {
                query.append_pair(key, &v);
            }
            None => return Err(GraphError::UnsupportedGetParameter(key.clone())),
        }
    }

    let url = format!(
        "{}/{}?{}",
        config::settings().graph_base_url,
        request.versioned_path(),
        query.finish()
    );

    Ok(WireRequest {
        url,
        method: request.method(),
        headers: common_headers(),
        body: None,
    })
}

fn serialize_single_post(request: &Request, s: &mut Serializer<'_>) -> Result<(), GraphError> {
    for (key, value) in &request.wire_parameters()? {
        match value {
            ParameterValue::Attachment(attachment) => s.write_file(key, attachment)?,
            scalar => {
                if let Some(v) = scalar.as_query_value() {
                    s.write_string(key, &v)?;
                }
            }
        }
    }
    for (key, value) in request.graph_object_key_values() {
        s.write_string(&key, &value)?;
    }
    Ok(())
}

fn serialize_batch(
    requests: &[Request],
    batch_application_id: &str,
    s: &mut Serializer<'_>,
) -> Result<(), GraphError> {
    s.write_string(BATCH_APP_ID_PARAM, batch_application_id)?;

    // Binary parameters are hoisted out of the JSON into named file parts;
    // numbering is contiguous across the whole batch.
    let mut attachments: Vec<(String, Attachment)> = Vec::new();
    let mut entries: Vec<Value> = Vec::new();

    for request in requests {
        let params = request.wire_parameters()?;

        let mut attached_files: Vec<String> = Vec::new();
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &params {
            match value {
                ParameterValue::Attachment(attachment) => {
                    let name = format!("{ATTACHMENT_FILENAME_PREFIX}{}", attachments.len());
                    attached_files.push(name.clone());
                    attachments.push((name, attachment.clone()));
                }
                scalar => {
                    if let Some(v) = scalar.as_query_value() {
                        query.append_pair(key, &v);
                    }
                }
            }
        }

        let query = query.finish();
        let relative_url = if query.is_empty() {
            request.versioned_path()
        } else {
            format!("{}?{}", request.versioned_path(), query)
        };

        let mut entry = json!({
            "relative_url": relative_url,
            "method": request.method().to_string(),
        });
        if let Some(name) = request.batch_entry_name() {
            entry["name"] = json!(name);
            entry["omit_response_on_success"] = json!(request.omit_response_on_success());
        }
        if let Some(depends_on) = request.depends_on() {
            entry["depends_on"] = json!(depends_on);
        }
        if !attached_files.is_empty() {
            entry["attached_files"] = json!(attached_files.join(","));
        }

        let body_pairs = request.graph_object_key_values();
        if !body_pairs.is_empty() {
            let mut body = form_urlencoded::Serializer::new(String::new());
            for (key, value) in &body_pairs {
                body.append_pair(key, value);
            }
            entry["body"] = json!(body.finish());
        }

        entries.push(entry);
    }

    s.write_string(BATCH_PARAM, &Value::Array(entries).to_string())?;
    for (name, attachment) in &attachments {
        s.write_file(name, attachment)?;
    }
    Ok(())
}

// ============================================================
// Multipart serializer and progress plumbing
// ============================================================

/// Writes `multipart/form-data` parts with the fixed boundary.
pub struct Serializer<'a> {
    out: &'a mut dyn Write,
}

impl<'a> Serializer<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self { out }
    }

    pub fn write_string(&mut self, name: &str, value: &str) -> Result<(), GraphError> {
        write!(
            self.out,
            "--{MIME_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )?;
        Ok(())
    }

    pub fn write_file(&mut self, name: &str, attachment: &Attachment) -> Result<(), GraphError> {
        write!(
            self.out,
            "--{MIME_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            attachment.filename, attachment.content_type
        )?;
        self.out.write_all(&attachment.bytes)?;
        self.out.write_all(b"\r\n")?;
        Ok(())
    }

    pub fn finish(self) -> Result<(), GraphError> {
        write!(self.out, "--{MIME_BOUNDARY}--\r\n")?;
        Ok(())
    }
}

/// Discards bytes, counting them. Used for the sizing pass.
#[derive(Default)]
struct CountingWriter {
    written: u64,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wraps the real body buffer and reports cumulative progress whenever at
/// least `threshold` bytes have been written since the last report.
struct ProgressWriter {
    inner: Vec<u8>,
    total: u64,
    threshold: u64,
    written: u64,
    last_reported: u64,
    callbacks: Vec<super::request::ProgressCallback>,
}

impl ProgressWriter {
    fn new(
        inner: Vec<u8>,
        total: u64,
        threshold: u64,
        callbacks: Vec<super::request::ProgressCallback>,
    ) -> Self {
        Self {
            inner,
            total,
            threshold,
            written: 0,
            last_reported: 0,
            callbacks,
        }
    }

    fn report(&mut self) {
        for callback in &self.callbacks {
            callback(self.written, self.total);
        }
        self.last_reported = self.written;
    }

    /// Final report, then hand back the body.
    fn complete(mut self) -> Vec<u8> {
        if self.written > self.last_reported || self.callbacks.is_empty() {
            self.report();
        }
        self.inner
    }
}

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.extend_from_slice(buf);
        self.written += buf.len() as u64;
        if self.written - self.last_reported >= self.threshold {
            self.report();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn body_text(wire: &WireRequest) -> String {
        String::from_utf8_lossy(wire.body.as_deref().unwrap_or_default()).to_string()
    }

    #[test]
    fn test_empty_batch_rejected() {
        let batch = RequestBatch::new(vec![]);
        assert!(matches!(batch.to_wire_request(), Err(GraphError::EmptyBatch)));
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let requests = (0..MAXIMUM_BATCH_SIZE + 1)
            .map(|_| Request::new(None, "me", HttpMethod::Get))
            .collect();
        let batch = RequestBatch::new(requests);
        assert!(matches!(
            batch.to_wire_request(),
            Err(GraphError::BatchTooLarge { .. })
        ));
    }

    #[test]
    fn test_single_get_uses_query_string() {
        let mut request = Request::new(None, "me", HttpMethod::Get);
        request.set_parameter("fields", "id,name");

        let wire = RequestBatch::from_request(request).to_wire_request().unwrap();
        assert_eq!(wire.method, HttpMethod::Get);
        assert!(wire.body.is_none());
        assert!(wire.url.contains("fields=id%2Cname"));
        assert!(wire.url.contains("format=json"));
        assert!(!wire
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type")));
    }

    #[test]
    fn test_single_get_rejects_attachment() {
        let mut request = Request::new(None, "me", HttpMethod::Get);
        request.set_attachment("picture", "p.png", "image/png", vec![1]);

        assert!(matches!(
            RequestBatch::from_request(request).to_wire_request(),
            Err(GraphError::UnsupportedGetParameter(_))
        ));
    }

    #[test]
    fn test_single_post_builds_multipart() {
        let mut request = Request::new(None, "me/feed", HttpMethod::Post);
        request.set_parameter("message", "hello world");

        let wire = RequestBatch::from_request(request).to_wire_request().unwrap();
        assert_eq!(wire.method, HttpMethod::Post);

        let body = body_text(&wire);
        assert!(body.contains("name=\"message\""));
        assert!(body.contains("hello world"));
        assert!(body.ends_with(&format!("--{MIME_BOUNDARY}--\r\n")));

        let content_type = wire
            .headers
            .iter()
            .find(|(k, _)| k == "Content-Type")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(content_type.contains(MIME_BOUNDARY));
    }

    // Serializes tests that mutate the process-wide settings.
    static SETTINGS_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_batch_requires_application_id() {
        let _guard = SETTINGS_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = config::settings();
        config::update_settings(|s| s.default_batch_application_id = None);

        let requests = vec![
            Request::new(None, "me", HttpMethod::Get),
            Request::new(None, "me/friends", HttpMethod::Get),
        ];
        let result = RequestBatch::new(requests).to_wire_request();
        config::set_settings(saved);

        assert!(matches!(result, Err(GraphError::MissingBatchApplicationId)));
    }

    #[test]
    fn test_batch_attachment_hoisting() {
        let mut batch = RequestBatch::new(vec![]);
        batch.set_batch_application_id("1234");

        let mut first = Request::new(None, "me/photos", HttpMethod::Post);
        first.set_attachment("picture", "a.png", "image/png", vec![0xAA]);
        batch.push(first);

        batch.push(Request::new(None, "me", HttpMethod::Get));

        let mut third = Request::new(None, "me/photos", HttpMethod::Post);
        third.set_attachment("picture", "b.png", "image/png", vec![0xBB]);
        batch.push(third);

        let wire = batch.to_wire_request().unwrap();
        let body = body_text(&wire);

        assert!(body.contains("name=\"file0\""));
        assert!(body.contains("name=\"file1\""));
        assert!(!body.contains("name=\"file2\""));

        let batch_json = extract_batch_json(&body);
        let entries = batch_json.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["attached_files"], "file0");
        assert!(entries[1].get("attached_files").is_none());
        assert_eq!(entries[2]["attached_files"], "file1");
    }

    #[test]
    fn test_batch_entry_metadata() {
        let mut batch = RequestBatch::new(vec![]);
        batch.set_batch_application_id("1234");

        let mut first = Request::new(None, "me", HttpMethod::Get);
        first.set_batch_entry_name("me-request");
        first.set_omit_response_on_success(false);
        batch.push(first);

        let mut second = Request::new(None, "{result=me-request:$.id}/friends", HttpMethod::Get);
        second.set_depends_on("me-request");
        batch.push(second);

        let wire = batch.to_wire_request().unwrap();
        let entries_json = extract_batch_json(&body_text(&wire));
        let entries = entries_json.as_array().unwrap();

        assert_eq!(entries[0]["name"], "me-request");
        assert_eq!(entries[0]["omit_response_on_success"], false);
        assert_eq!(entries[0]["method"], "GET");
        assert_eq!(entries[1]["depends_on"], "me-request");
    }

    #[test]
    fn test_progress_reports_reach_total() {
        let reports: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();

        let mut request = Request::new(None, "me/photos", HttpMethod::Post);
        request.set_attachment("picture", "big.bin", "application/octet-stream", vec![0; 4096]);
        request.set_progress_callback(Arc::new(move |written, total| {
            sink.lock().unwrap().push((written, total));
        }));

        let wire = RequestBatch::from_request(request).to_wire_request().unwrap();
        let body_len = wire.body.unwrap().len() as u64;

        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        let (written, total) = *reports.last().unwrap();
        assert_eq!(written, body_len);
        assert_eq!(total, body_len);
    }

    fn extract_batch_json(body: &str) -> Value {
        let marker = "name=\"batch\"\r\n\r\n";
        let start = body.find(marker).expect("batch part present") + marker.len();
        let end = body[start..].find("\r\n").unwrap() + start;
        serde_json::from_str(&body[start..end]).expect("batch JSON parses")
    }
}
