// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! GraphKit - client SDK for a graph-style social platform API.
//!
//! GraphKit manages login sessions and their credentials, serializes one or
//! many graph API calls into a single HTTP round trip, demultiplexes the
//! results, and buffers application usage events for periodic upload.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`error`] - Error types and result aliases
//! - [`config`] - Process-wide SDK settings and diagnostic channels
//! - [`telemetry`] - Tracing subscriber setup for host applications
//! - [`token`] - Access tokens and their persistence bundles
//! - [`auth`] - Authorization strategies and the coordinator that runs them
//! - [`session`] - The session lifecycle state machine
//! - [`graph`] - Request/batch serialization, execution, and response demux
//! - [`events`] - Application event buffering and flush
//! - [`context`] - Process-wide shared state (active session, HTTP client)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use graphkit::session::Session;
//! use graphkit::token::FileTokenStore;
//! use graphkit::graph::{self, Request};
//!
//! let store = Arc::new(FileTokenStore::new("token.json"));
//! let session = Session::new("my-app-id", store, Some(agent));
//! session.open_for_read(vec!["email".into()], Default::default())?;
//!
//! let me = Request::new_me_request(session.clone());
//! let response = graph::execute_request(graphkit::context::http_client(), me).await?;
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod graph;
pub mod session;
pub mod telemetry;
pub mod token;

// Re-export commonly used types at crate root
pub use auth::{
    AgentResult, AuthAgent, AuthOutcome, AuthorizationCoordinator, AuthorizationRequest,
    LoginBehavior, StartOutcome, StrategyKind,
};
pub use error::{AuthError, EventError, GraphError, Result, SessionError, StoreError};
pub use events::{AppEvent, AppEventsLogger, FlushReason, FlushResult};
pub use graph::{
    HttpMethod, ParameterValue, Request, RequestBatch, RequestError, Response,
};
pub use session::{Session, SessionSnapshot, SessionState, StateChangeObserver};
pub use token::{AccessToken, AccessTokenSource, TokenStore};

/// GraphKit version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        // Verify key types are accessible
        let _token = AccessToken::empty();
        let _request = Request::new(None, "me", HttpMethod::Get);
    }
}
