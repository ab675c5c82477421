// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Classification of remote-service errors.
//!
//! The graph endpoint reports failures either as a nested `error` object or as
//! flat legacy fields. [`RequestError`] normalizes both into one record and
//! assigns a [`Category`] that suggests the caller's next move. The SDK never
//! retries on the caller's behalf.

use serde_json::Value;

/// Error code meaning the session credential is no longer valid.
pub const INVALID_TOKEN_ERROR_CODE: i64 = 190;
/// Error code for an invalid session (legacy variant of 190).
pub const INVALID_SESSION_ERROR_CODE: i64 = 102;

const EC_UNKNOWN: i64 = -1;
const EC_API_SESSION: i64 = 102;
const EC_SERVICE: i64 = 2;
const EC_UNKNOWN_API: i64 = 1;
const EC_APP_TOO_MANY_CALLS: i64 = 4;
const EC_USER_TOO_MANY_CALLS: i64 = 17;
const EC_PERMISSION_DENIED: i64 = 10;
const EC_INVALID_TOKEN: i64 = 190;
const EC_PERMISSION_RANGE: std::ops::RangeInclusive<i64> = 200..=299;

// Sub-codes of 102/190 that mean "retry the call", not "reopen the session".
const ESC_APP_NOT_INSTALLED: i64 = 458;
const ESC_APP_INACTIVE: i64 = 459;
const ESC_SESSION_TIMED_OUT: i64 = 464;

/// Suggested caller action for a remote error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Retrying the exact same call may succeed.
    AuthenticationRetry,
    /// The session credential is dead; close the session and log in again.
    AuthenticationReopenSession,
    /// A permission the call needs was not granted.
    Permission,
    /// Remote service fault; retry later.
    Server,
    /// The caller is being rate limited; back off.
    Throttling,
    /// The request itself was malformed.
    BadRequest,
    /// Local failure (connection, parse) rather than a remote verdict.
    Client,
    /// Anything the SDK cannot classify further.
    Other,
}

/// Normalized remote (or local) failure attached to a single response.
#[derive(Debug, Clone)]
pub struct RequestError {
    category: Category,
    error_code: i64,
    sub_error_code: i64,
    error_type: Option<String>,
    error_message: Option<String>,
    error_user_title: Option<String>,
    error_user_message: Option<String>,
    request_status_code: u16,
}

impl RequestError {
    /// Wrap a local failure (connection loss, parse failure) as a client
    /// error applied uniformly to a request.
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            category: Category::Client,
            error_code: EC_UNKNOWN,
            sub_error_code: EC_UNKNOWN,
            error_type: None,
            error_message: Some(message.into()),
            error_user_title: None,
            error_user_message: None,
            request_status_code: 0,
        }
    }

    /// Extract an error from one demultiplexed batch element, if present.
    ///
    /// Recognizes the nested `error` object form as well as the flat legacy
    /// `error_code`/`error_msg`/`error_reason` fields. Returns `None` when the
    /// element carries no error markers at all.
    pub fn from_body(status: u16, body: &Value) -> Option<Self> {
        let object = body.as_object()?;

        let mut error_code = EC_UNKNOWN;
        let mut sub_error_code = EC_UNKNOWN;
        let mut error_type = None;
        let mut error_message = None;
        let mut error_user_title = None;
        let mut error_user_message = None;
        let mut found = false;

        if let Some(error) = object.get("error").and_then(Value::as_object) {
            found = true;
            error_code = error.get("code").and_then(Value::as_i64).unwrap_or(EC_UNKNOWN);
            sub_error_code = error
                .get("error_subcode")
                .and_then(Value::as_i64)
                .unwrap_or(EC_UNKNOWN);
            error_type = error.get("type").and_then(Value::as_str).map(str::to_string);
            error_message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            error_user_title = error
                .get("error_user_title")
                .and_then(Value::as_str)
                .map(str::to_string);
            error_user_message = error
                .get("error_user_msg")
                .and_then(Value::as_str)
                .map(str::to_string);
        } else if object.contains_key("error_code")
            || object.contains_key("error_msg")
            || object.contains_key("error_reason")
        {
            found = true;
            error_code = object
                .get("error_code")
                .and_then(value_as_i64)
                .unwrap_or(EC_UNKNOWN);
            error_type = object
                .get("error_reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            error_message = object
                .get("error_msg")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        if !found {
            return None;
        }

        Some(Self {
            category: classify(error_code, sub_error_code, status),
            error_code,
            sub_error_code,
            error_type,
            error_message,
            error_user_title,
            error_user_message,
            request_status_code: status,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn error_code(&self) -> i64 {
        self.error_code
    }

    pub fn sub_error_code(&self) -> i64 {
        self.sub_error_code
    }

    pub fn error_type(&self) -> Option<&str> {
        self.error_type.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn error_user_title(&self) -> Option<&str> {
        self.error_user_title.as_deref()
    }

    pub fn error_user_message(&self) -> Option<&str> {
        self.error_user_message.as_deref()
    }

    pub fn request_status_code(&self) -> u16 {
        self.request_status_code
    }

    /// Whether the error carries a message meant for the end user.
    pub fn should_notify_user(&self) -> bool {
        self.error_user_message
            .as_deref()
            .is_some_and(|m| !m.is_empty())
    }

    /// Whether this error should invalidate the bound session's token.
    pub fn invalidates_token(&self) -> bool {
        self.error_code == INVALID_TOKEN_ERROR_CODE
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (code {}): {}",
            self.category,
            self.error_code,
            self.error_message.as_deref().unwrap_or("unknown error")
        )
    }
}

fn classify(code: i64, sub_code: i64, status: u16) -> Category {
    match code {
        EC_UNKNOWN_API | EC_SERVICE => Category::Server,
        EC_APP_TOO_MANY_CALLS | EC_USER_TOO_MANY_CALLS => Category::Throttling,
        EC_PERMISSION_DENIED => Category::Permission,
        EC_API_SESSION | EC_INVALID_TOKEN => match sub_code {
            ESC_APP_NOT_INSTALLED | ESC_APP_INACTIVE | ESC_SESSION_TIMED_OUT => {
                Category::AuthenticationRetry
            }
            _ => Category::AuthenticationReopenSession,
        },
        c if EC_PERMISSION_RANGE.contains(&c) => Category::Permission,
        _ => {
            if !(200..300).contains(&status) {
                Category::BadRequest
            } else {
                Category::Other
            }
        }
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}
