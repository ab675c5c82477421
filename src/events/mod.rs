// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application event buffering and upload.
//!
//! Each credential/application pair owns one in-memory [`SessionEventsState`]
//! capped at [`MAX_ACCUMULATED_LOG_EVENTS`]; events past the cap are dropped
//! and counted, and the drop count rides along on the next flush so the
//! backend can see the loss. A flush moves the buffer to an in-flight list
//! and uploads it as one `activities` call. At most one flush runs at a time
//! process-wide; only a flush that never reached the network persists its
//! events for retry.

pub mod store;

pub use store::{EventStore, FileEventStore, MemoryEventStore};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{self, FlushBehavior};
use crate::context;
use crate::graph::{self, Category, HttpMethod, Request};
use crate::session::Session;

/// Cap on events buffered per credential/application pair.
pub const MAX_ACCUMULATED_LOG_EVENTS: usize = 1000;

/// Buffered-event count that triggers an automatic flush.
pub const FLUSH_EVENT_THRESHOLD: usize = 100;

/// Period of the background flush timer.
pub const FLUSH_PERIOD_SECONDS: u64 = 60;

const ACTIVITIES_PATH_SUFFIX: &str = "activities";
const CUSTOM_APP_EVENTS: &str = "CUSTOM_APP_EVENTS";

/// Why a flush was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    ExplicitRequest,
    Timer,
    SessionChange,
    PersistedEvents,
    EventThreshold,
}

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    Success,
    ServerError,
    /// The upload never reached the network; events were persisted for retry.
    NoConnectivity,
    UnknownError,
}

/// Identifies the buffer an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    access_token: String,
    application_id: String,
}

impl EventKey {
    pub fn new(access_token: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            application_id: application_id.into(),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Stable string form used to key the shared buffer map and the
    /// persistence store.
    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.application_id, self.access_token)
    }

    /// Inverse of [`Self::storage_key`].
    pub fn from_storage_key(key: &str) -> Self {
        let (application_id, access_token) = key.split_once('|').unwrap_or((key, ""));
        Self::new(access_token, application_id)
    }
}

/// One logged application event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppEvent {
    name: String,
    time: DateTime<Utc>,
    value_to_sum: Option<f64>,
    parameters: BTreeMap<String, String>,
    is_implicit: bool,
}

impl AppEvent {
    pub fn new(
        name: impl Into<String>,
        value_to_sum: Option<f64>,
        parameters: BTreeMap<String, String>,
        is_implicit: bool,
    ) -> Self {
        Self {
            name: name.into(),
            time: Utc::now(),
            value_to_sum,
            parameters,
            is_implicit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn to_wire_json(&self) -> Value {
        let mut object = json!({
            "_eventName": self.name,
            "_logTime": self.time.timestamp(),
        });
        if let Some(value) = self.value_to_sum {
            object["_valueToSum"] = json!(value);
        }
        if self.is_implicit {
            object["_implicitlyLogged"] = json!("1");
        }
        for (key, value) in &self.parameters {
            object[key] = json!(value);
        }
        object
    }
}

/// Per-key event buffer: accumulated events, the in-flight list of the
/// current upload, and the count of events dropped at the cap.
#[derive(Default)]
pub struct SessionEventsState {
    accumulated: Vec<AppEvent>,
    in_flight: Vec<AppEvent>,
    num_skipped: u32,
}

impl SessionEventsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an event, dropping and counting it when the cap is reached.
    /// The cap covers everything resident in the buffer, including events
    /// currently riding an upload.
    pub fn add_event(&mut self, event: AppEvent) {
        if self.accumulated.len() + self.in_flight.len() >= MAX_ACCUMULATED_LOG_EVENTS {
            self.num_skipped += 1;
        } else {
            self.accumulated.push(event);
        }
    }

    pub fn accumulated_count(&self) -> usize {
        self.accumulated.len()
    }

    pub fn skipped_count(&self) -> u32 {
        self.num_skipped
    }

    /// Move the accumulated buffer onto the in-flight list, returning the
    /// number of events now awaiting upload.
    pub fn begin_flush(&mut self) -> usize {
        self.in_flight.append(&mut self.accumulated);
        self.in_flight.len()
    }

    /// Snapshot of the in-flight list, for persistence on connectivity loss.
    pub fn in_flight_snapshot(&self) -> Vec<AppEvent> {
        self.in_flight.clone()
    }

    /// The upload payload: the in-flight events as a JSON array, plus the
    /// drop count to report upstream.
    pub fn flush_payload(&self) -> (Value, u32) {
        let events: Vec<Value> = self.in_flight.iter().map(AppEvent::to_wire_json).collect();
        (Value::Array(events), self.num_skipped)
    }

    /// Forget the in-flight list and reset the drop counter after an upload
    /// attempt concluded (whatever the outcome).
    pub fn clear_in_flight_and_stats(&mut self) {
        self.in_flight.clear();
        self.num_skipped = 0;
    }

    /// Put restored events in front of anything accumulated since.
    pub fn restore_events(&mut self, events: Vec<AppEvent>) {
        let mut merged = events;
        merged.append(&mut self.accumulated);
        self.accumulated = merged;
    }
}

/// Summary of one flush pass across all buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub events_flushed: usize,
    pub result: FlushResult,
}

/// Entry point for logging application events.
///
/// Loggers are cheap handles onto the shared per-key buffers; create one per
/// call site or hold one long-term, both work.
#[derive(Debug, Clone)]
pub struct AppEventsLogger {
    key: EventKey,
}

impl AppEventsLogger {
    /// Logger bound to a session's credential.
    pub fn for_session(session: &Session) -> Self {
        Self {
            key: EventKey::new(
                session.access_token().token(),
                session.application_id(),
            ),
        }
    }

    /// Logger for app-scoped (credential-less) events.
    pub fn for_application(application_id: impl Into<String>) -> Self {
        Self {
            key: EventKey::new("", application_id),
        }
    }

    pub fn event_key(&self) -> &EventKey {
        &self.key
    }

    pub fn log_event(&self, name: impl Into<String>) {
        self.log(AppEvent::new(name, None, BTreeMap::new(), false));
    }

    pub fn log_event_with_parameters(
        &self,
        name: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) {
        self.log(AppEvent::new(name, None, parameters, false));
    }

    pub fn log_event_with_value(
        &self,
        name: impl Into<String>,
        value_to_sum: f64,
        parameters: BTreeMap<String, String>,
    ) {
        self.log(AppEvent::new(name, Some(value_to_sum), parameters, false));
    }

    fn log(&self, event: AppEvent) {
        #[cfg(feature = "telemetry")]
        if config::is_logging_behavior_enabled(config::LoggingBehavior::AppEvents) {
            tracing::debug!(event = event.name(), key = %self.key.storage_key(), "buffering app event");
        }

        let state = context::events_state_for(&self.key.storage_key());
        let over_threshold = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.add_event(event);
            state.accumulated_count() >= FLUSH_EVENT_THRESHOLD
        };

        if over_threshold && config::settings().flush_behavior == FlushBehavior::Auto {
            request_flush(FlushReason::EventThreshold);
        }
    }

    /// Ask for a flush of all buffers on a background task.
    pub fn flush(&self) {
        request_flush(FlushReason::ExplicitRequest);
    }
}

static FLUSH_TIMER_STARTED: std::sync::atomic::AtomicBool =
    std::sync::atomic::AtomicBool::new(false);

/// Start the periodic background flush, once per process. Requires a tokio
/// runtime; call from within one. Does nothing when flushing is explicit-only
/// at each tick.
pub fn start_flush_timer() {
    use std::sync::atomic::Ordering;
    if FLUSH_TIMER_STARTED.swap(true, Ordering::SeqCst) {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        FLUSH_TIMER_STARTED.store(false, Ordering::SeqCst);
        return;
    };
    handle.spawn(async {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(FLUSH_PERIOD_SECONDS));
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            if config::settings().flush_behavior == FlushBehavior::Auto {
                flush_and_wait(FlushReason::Timer).await;
            }
        }
    });
}

/// Schedule a flush on the current tokio runtime; a no-op without one.
pub fn request_flush(reason: FlushReason) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            flush_and_wait(reason).await;
        });
    } else {
        #[cfg(feature = "telemetry")]
        tracing::debug!(?reason, "flush requested outside a runtime; skipped");
    }
}

/// Flush every buffer with pending events as one pass.
///
/// A pass already in flight makes this a no-op. Returns the pass summary, or
/// `None` when the pass was skipped.
pub async fn flush_and_wait(reason: FlushReason) -> Option<FlushOutcome> {
    if !context::try_begin_flush() {
        return None;
    }

    #[cfg(feature = "telemetry")]
    if config::is_logging_behavior_enabled(config::LoggingBehavior::AppEvents) {
        tracing::debug!(?reason, "starting app event flush");
    }
    let _ = reason;

    // Fold persisted (connectivity-failed) events back in first, so they ride
    // this upload.
    match context::event_store().load_and_clear() {
        Ok(persisted) => {
            for (key, events) in persisted {
                let state = context::events_state_for(&key);
                state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .restore_events(events);
            }
        }
        Err(e) => {
            #[cfg(feature = "telemetry")]
            tracing::warn!(error = %e, "failed to restore persisted events");
            let _ = e;
        }
    }

    let mut total_flushed = 0usize;
    let mut worst = FlushResult::Success;

    for (key_string, state) in context::all_event_states() {
        let (count, payload, num_skipped, snapshot) = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            let count = state.begin_flush();
            if count == 0 {
                continue;
            }
            let (payload, num_skipped) = state.flush_payload();
            (count, payload, num_skipped, state.in_flight_snapshot())
        };

        let key = EventKey::from_storage_key(&key_string);
        let request = build_flush_request(&key, &payload, num_skipped);
        let result = match graph::execute_request(context::http_client(), request).await {
            Ok(response) => match response.error() {
                None => FlushResult::Success,
                Some(error) if error.category() == Category::Client => FlushResult::NoConnectivity,
                Some(_) => FlushResult::ServerError,
            },
            Err(_) => FlushResult::UnknownError,
        };

        if result == FlushResult::NoConnectivity {
            if let Err(e) = context::event_store().persist(&key_string, &snapshot) {
                #[cfg(feature = "telemetry")]
                tracing::warn!(error = %e, "failed to persist unflushed events");
                let _ = e;
            }
        }

        state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear_in_flight_and_stats();

        if result == FlushResult::Success {
            total_flushed += count;
        } else {
            worst = result;
        }
    }

    context::end_flush();
    Some(FlushOutcome {
        events_flushed: total_flushed,
        result: worst,
    })
}

fn build_flush_request(key: &EventKey, payload: &Value, num_skipped: u32) -> Request {
    let mut request = Request::new(
        None,
        format!("{}/{ACTIVITIES_PATH_SUFFIX}", key.application_id()),
        HttpMethod::Post,
    );
    request.set_parameter("event", CUSTOM_APP_EVENTS);
    request.set_parameter("anon_id", context::anonymous_id());
    request.set_parameter("custom_events_file", payload.to_string());
    if num_skipped > 0 {
        request.set_parameter("num_skipped_events", num_skipped as i64);
    }
    if !key.access_token().is_empty() {
        request.set_parameter(graph::request::ACCESS_TOKEN_PARAM, key.access_token());
    }
    request
}
