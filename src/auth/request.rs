// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Value objects describing one authorization attempt.

use crate::token::AccessToken;

/// Which strategy families an authorization attempt may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginBehavior {
    /// Prefer the native platform app, fall back to a hosted web view.
    #[default]
    NativeWithFallback,
    /// Only the native platform app; fail if unavailable.
    NativeOnly,
    /// Only the hosted web view.
    SuppressNative,
}

impl LoginBehavior {
    pub fn allows_native(&self) -> bool {
        matches!(self, Self::NativeWithFallback | Self::NativeOnly)
    }

    pub fn allows_web_view(&self) -> bool {
        matches!(self, Self::NativeWithFallback | Self::SuppressNative)
    }
}

/// Audience applied to publish permissions granted by this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultAudience {
    #[default]
    None,
    OnlyMe,
    Friends,
    Everyone,
}

impl DefaultAudience {
    /// Wire value sent to the authorization agent, if any.
    pub fn wire_value(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::OnlyMe => Some("only_me"),
            Self::Friends => Some("friends"),
            Self::Everyone => Some("everyone"),
        }
    }
}

/// Everything the coordinator needs to run one authorization attempt.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    application_id: String,
    permissions: Vec<String>,
    behavior: LoginBehavior,
    default_audience: DefaultAudience,
    /// Opaque code correlating an external UI result back to this request.
    request_code: i32,
    /// When set, a successful result must prove it belongs to the same user
    /// as this token, and the granted permission list is refreshed.
    previous_token: Option<AccessToken>,
}

impl AuthorizationRequest {
    pub fn new(application_id: impl Into<String>, permissions: Vec<String>) -> Self {
        Self {
            application_id: application_id.into(),
            permissions,
            behavior: LoginBehavior::default(),
            default_audience: DefaultAudience::default(),
            request_code: DEFAULT_AUTH_REQUEST_CODE,
            previous_token: None,
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }

    pub fn set_permissions(&mut self, permissions: Vec<String>) {
        self.permissions = permissions;
    }

    pub fn behavior(&self) -> LoginBehavior {
        self.behavior
    }

    pub fn set_behavior(&mut self, behavior: LoginBehavior) {
        self.behavior = behavior;
    }

    pub fn default_audience(&self) -> DefaultAudience {
        self.default_audience
    }

    pub fn set_default_audience(&mut self, audience: DefaultAudience) {
        self.default_audience = audience;
    }

    pub fn request_code(&self) -> i32 {
        self.request_code
    }

    pub fn set_request_code(&mut self, code: i32) {
        self.request_code = code;
    }

    pub fn previous_token(&self) -> Option<&AccessToken> {
        self.previous_token.as_ref()
    }

    /// Mark this attempt as a reauthorization that must keep the same user.
    pub fn set_previous_token(&mut self, token: AccessToken) {
        self.previous_token = Some(token);
    }

    pub fn is_reauthorization(&self) -> bool {
        self.previous_token.is_some()
    }
}

/// Default external-UI correlation code.
pub const DEFAULT_AUTH_REQUEST_CODE: i32 = 0xface;
