// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the GraphKit SDK.
//!
//! This module provides strongly-typed errors for different parts of the SDK,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error
//! propagation. Caller faults (invalid state transitions, malformed permission
//! requests) are surfaced synchronously through these types; remote-service
//! failures travel through the `Response` channel instead (see
//! [`crate::graph::RequestError`]).

use thiserror::Error;

/// Errors raised by [`crate::session::Session`] state transitions.
///
/// All of these are caller/programming faults: they are not retryable and must
/// be fixed at the call site.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session: an attempt was made to open an already opened session")]
    AlreadyOpened,

    #[error("Session: an attempt was made to use a session that has been closed")]
    ClosedSessionReuse,

    #[error("Session: an attempt was made to open a session that has a pending request")]
    PendingRequest,

    #[error("Session: {0} is only allowed from an opened state")]
    NotOpened(String),

    #[error("Cannot request publish or manage authorization with no permissions")]
    EmptyPublishPermissions,

    #[error("Cannot pass a publish or manage permission ({0}) to a request for read authorization")]
    PublishPermissionOnRead(String),

    #[error("Session has no authorization agent configured")]
    NoAuthAgent,
}

impl SessionError {
    /// All session errors are programming faults, never transient.
    pub fn is_caller_fault(&self) -> bool {
        true
    }
}

/// Errors produced while obtaining a credential through the
/// authorization coordinator.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Login attempt failed")]
    NoStrategyStarted,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid access token")]
    InvalidToken,

    #[error("User logged in as different user")]
    DifferentUser,

    #[error("{error_type}: {description}")]
    Agent {
        error_type: String,
        description: String,
        code: Option<i64>,
    },

    #[error("Attempted to continue authorization without a pending request")]
    NoPendingRequest,
}

impl AuthError {
    /// Whether this failure was an explicit user cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Errors that can occur while building or executing graph requests.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("A batch must not be empty")]
    EmptyBatch,

    #[error("Batch size {size} exceeds maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error(
        "At least one request in a batch must have an open session, \
         or a default application id must be specified"
    )]
    MissingBatchApplicationId,

    #[error("Session provided to a request is in an un-opened state")]
    SessionNotOpened,

    #[error("Unsupported parameter type for GET request: {0}")]
    UnsupportedGetParameter(String),

    #[error("Invalid graph URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected number of results: expected {expected}, got {actual}")]
    ResponseCountMismatch { expected: usize, actual: usize },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response parsing error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl GraphError {
    /// Caller faults are misuses of the API surface, fixed at the call site.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            Self::EmptyBatch
                | Self::BatchTooLarge { .. }
                | Self::MissingBatchApplicationId
                | Self::SessionNotOpened
                | Self::UnsupportedGetParameter(_)
        )
    }

    /// Whether this failure could succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Errors raised by token and event stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store entry not found: {0}")]
    NotFound(String),

    #[error("Unsupported schema version: {0}")]
    UnsupportedSchemaVersion(u32),

    #[error("Corrupted payload: {0}")]
    Corrupted(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupted(err.to_string())
    }
}

/// Errors that can occur while buffering or flushing application events.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event flush failed: {0}")]
    FlushFailed(String),

    #[error("Event store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
