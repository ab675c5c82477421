// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide SDK settings.
//!
//! GraphKit is a library, so "configuration" is the set of static options the
//! host application establishes once at startup: application id, client token,
//! default graph API version, diagnostic channels, and the tunables used by the
//! request and event pipelines. All access goes through accessor functions that
//! take the settings lock; reads are cheap clones of small values.

use std::collections::BTreeSet;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

/// Default graph API version prepended to unversioned paths.
pub const DEFAULT_API_VERSION: &str = "v2.2";

/// Default graph endpoint.
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.graphkit.dev";

/// Default number of bytes written between progress reports.
pub const DEFAULT_PROGRESS_THRESHOLD_BYTES: u64 = 65536;

static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(Settings::default()));

fn read_settings() -> std::sync::RwLockReadGuard<'static, Settings> {
    SETTINGS.read().unwrap_or_else(|e| e.into_inner())
}

fn write_settings() -> std::sync::RwLockWriteGuard<'static, Settings> {
    SETTINGS.write().unwrap_or_else(|e| e.into_inner())
}

/// Diagnostic channels that can be independently enabled.
///
/// Nothing is logged on a channel unless the host application enables it; the
/// `IncludeAccessTokens` channel additionally controls whether token strings
/// are redacted from other channels' output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingBehavior {
    /// Request serialization and response summaries.
    Requests,
    /// Raw access token strings (otherwise redacted).
    IncludeAccessTokens,
    /// Full raw response bodies.
    IncludeRawResponses,
    /// Application event buffering and flushing.
    AppEvents,
    /// SDK misuse diagnostics.
    DeveloperErrors,
}

/// When accumulated application events are uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushBehavior {
    /// Flush automatically when the event-count threshold is reached.
    #[default]
    Auto,
    /// Flush only when the host application asks for it.
    ExplicitOnly,
}

/// The full set of static SDK options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application id used for sessions and sessionless requests.
    pub application_id: Option<String>,
    /// Client token paired with the application id for app-scoped access.
    pub client_token: Option<String>,
    /// Graph API version prepended to unversioned paths.
    pub api_version: String,
    /// Base URL of the graph endpoint.
    pub graph_base_url: String,
    /// Application id used for batches whose requests carry no open session.
    pub default_batch_application_id: Option<String>,
    /// Bytes written between upload-progress reports.
    pub progress_threshold_bytes: u64,
    /// Event flush policy.
    pub flush_behavior: FlushBehavior,
    /// Enabled diagnostic channels.
    pub logging_behaviors: BTreeSet<LoggingBehavior>,
    /// Runtime that request callbacks and observer notifications are posted
    /// to when the batch carries no delivery handle of its own. `None` means
    /// they run inline on the calling thread.
    #[serde(skip)]
    pub callback_handle: Option<Handle>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut logging_behaviors = BTreeSet::new();
        logging_behaviors.insert(LoggingBehavior::DeveloperErrors);
        Self {
            application_id: None,
            client_token: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            default_batch_application_id: None,
            progress_threshold_bytes: DEFAULT_PROGRESS_THRESHOLD_BYTES,
            flush_behavior: FlushBehavior::Auto,
            logging_behaviors,
            callback_handle: None,
        }
    }
}

/// Get a snapshot of the current settings.
pub fn settings() -> Settings {
    read_settings().clone()
}

/// Replace the current settings wholesale.
pub fn set_settings(new: Settings) {
    *write_settings() = new;
}

/// Mutate the current settings in place.
pub fn update_settings(f: impl FnOnce(&mut Settings)) {
    f(&mut write_settings());
}

/// The configured application id, if any.
pub fn application_id() -> Option<String> {
    read_settings().application_id.clone()
}

/// Set the process-wide application id.
pub fn set_application_id(id: impl Into<String>) {
    write_settings().application_id = Some(id.into());
}

/// The configured client token, if any.
pub fn client_token() -> Option<String> {
    read_settings().client_token.clone()
}

/// Set the client token used for app-scoped sessionless requests.
pub fn set_client_token(token: impl Into<String>) {
    write_settings().client_token = Some(token.into());
}

/// The graph API version prepended to unversioned paths.
pub fn api_version() -> String {
    read_settings().api_version.clone()
}

/// The application id used for batches without an open session.
pub fn default_batch_application_id() -> Option<String> {
    read_settings().default_batch_application_id.clone()
}

/// Set the application id used for batches without an open session.
pub fn set_default_batch_application_id(id: impl Into<String>) {
    write_settings().default_batch_application_id = Some(id.into());
}

/// The fallback delivery runtime for callbacks and notifications, if any.
pub fn callback_handle() -> Option<Handle> {
    read_settings().callback_handle.clone()
}

/// Post callbacks and notifications to the given runtime instead of running
/// them inline on the calling thread.
pub fn set_callback_handle(handle: Handle) {
    write_settings().callback_handle = Some(handle);
}

/// Whether a diagnostic channel is enabled.
pub fn is_logging_behavior_enabled(behavior: LoggingBehavior) -> bool {
    read_settings().logging_behaviors.contains(&behavior)
}

/// Enable a diagnostic channel.
pub fn add_logging_behavior(behavior: LoggingBehavior) {
    write_settings().logging_behaviors.insert(behavior);
}

/// Disable a diagnostic channel.
pub fn remove_logging_behavior(behavior: LoggingBehavior) {
    write_settings().logging_behaviors.remove(&behavior);
}

/// Redact a token string unless the IncludeAccessTokens channel is enabled.
pub fn loggable_token(token: &str) -> String {
    if token.is_empty() {
        "<none>".to_string()
    } else if is_logging_behavior_enabled(LoggingBehavior::IncludeAccessTokens) {
        token.to_string()
    } else {
        "ACCESS_TOKEN_REMOVED".to_string()
    }
}
