// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Access tokens and their persistence bundles.
//!
//! An [`AccessToken`] is an immutable snapshot of a credential: the token
//! string, its expiry, the granted and declined permission sets, how it was
//! obtained, and when it was last refreshed. Tokens are never mutated after
//! construction; a refresh produces a new instance. Every factory path yields
//! either a fully valid token or the canonical [empty token](AccessToken::empty)
//! — never a partially populated one.

pub mod store;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config;

pub use store::{FileTokenStore, MemoryTokenStore, TokenBundle, TokenStore};

/// Bundle key carrying the token string in authorization results.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Bundle key carrying seconds-until-expiry in authorization results.
pub const EXPIRES_IN_KEY: &str = "expires_in";
/// Bundle key carrying an absolute epoch expiry in native-login results.
pub const EXPIRES_EPOCH_KEY: &str = "expires_seconds_since_epoch";
/// Bundle key carrying the comma-separated granted permission list.
pub const GRANTED_SCOPES_KEY: &str = "granted_scopes";
/// Bundle key carrying the comma-separated declined permission list.
pub const DENIED_SCOPES_KEY: &str = "denied_scopes";
/// Bundle key carrying the comma-separated permission list in native results.
pub const PERMISSIONS_KEY: &str = "permissions";

/// A flat string-keyed map as produced by external authorization flows.
pub type AuthBundle = BTreeMap<String, String>;

/// How an access token was originally obtained.
///
/// Only tokens issued through the platform application support silent
/// extension; web-view tokens must go through a full reauthorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTokenSource {
    /// No credential.
    None,
    /// Platform application, web login dialog.
    AppWeb,
    /// Platform application, native login dialog.
    AppNative,
    /// Platform application background service.
    AppService,
    /// SDK-hosted web view.
    WebView,
    /// Test fixture credential.
    TestUser,
}

impl AccessTokenSource {
    /// Whether tokens from this source support silent background extension.
    pub fn can_extend_token(&self) -> bool {
        matches!(
            self,
            Self::AppWeb | Self::AppNative | Self::AppService | Self::TestUser
        )
    }
}

/// Immutable credential snapshot.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires: DateTime<Utc>,
    permissions: BTreeSet<String>,
    declined_permissions: BTreeSet<String>,
    source: AccessTokenSource,
    last_refresh: DateTime<Utc>,
}

impl AccessToken {
    fn new(
        token: String,
        expires: DateTime<Utc>,
        permissions: BTreeSet<String>,
        declined_permissions: BTreeSet<String>,
        source: AccessTokenSource,
        last_refresh: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            expires,
            permissions,
            declined_permissions,
            source,
            last_refresh,
        }
    }

    /// The canonical empty token: no credential, already expired.
    pub fn empty() -> Self {
        Self::new(
            String::new(),
            DateTime::<Utc>::MIN_UTC,
            BTreeSet::new(),
            BTreeSet::new(),
            AccessTokenSource::None,
            Utc::now(),
        )
    }

    /// The token string.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the token expires.
    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    /// Permissions granted to this token.
    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    /// Permissions the user declined when this token was obtained.
    pub fn declined_permissions(&self) -> &BTreeSet<String> {
        &self.declined_permissions
    }

    /// How the token was obtained.
    pub fn source(&self) -> AccessTokenSource {
        self.source
    }

    /// When the token was last refreshed (or first obtained).
    pub fn last_refresh(&self) -> DateTime<Utc> {
        self.last_refresh
    }

    /// A token is invalid iff it carries no credential or has expired.
    pub fn is_invalid(&self) -> bool {
        self.is_invalid_at(Utc::now())
    }

    /// [`Self::is_invalid`] evaluated against a supplied clock.
    pub fn is_invalid_at(&self, now: DateTime<Utc>) -> bool {
        self.token.is_empty() || now > self.expires
    }

    /// Create a token from previously obtained credentials (e.g. imported
    /// from an integration that predates the SDK).
    ///
    /// Missing expiry means "never expires" until the first refresh corrects
    /// it; missing source defaults to the platform web login.
    pub fn from_existing(
        token: impl Into<String>,
        expires: Option<DateTime<Utc>>,
        last_refresh: Option<DateTime<Utc>>,
        source: Option<AccessTokenSource>,
        permissions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self::new(
            token.into(),
            expires.unwrap_or(DateTime::<Utc>::MAX_UTC),
            permissions.into_iter().collect(),
            BTreeSet::new(),
            source.unwrap_or(AccessTokenSource::AppWeb),
            last_refresh.unwrap_or_else(Utc::now),
        )
    }

    /// Create a token from a native-login result bundle.
    ///
    /// Native results carry an absolute epoch expiry rather than a
    /// seconds-from-now offset.
    pub fn from_native_login(bundle: &AuthBundle, source: AccessTokenSource) -> Self {
        let expires = bundle_seconds_as_date(bundle, EXPIRES_EPOCH_KEY, DateTime::UNIX_EPOCH);
        let permissions = split_scopes(bundle.get(PERMISSIONS_KEY));
        let token = bundle.get(ACCESS_TOKEN_KEY).cloned().unwrap_or_default();

        Self::create(permissions, BTreeSet::new(), token, expires, source)
    }

    /// Create a token from a web-login result bundle.
    ///
    /// When the result carries explicit granted/denied scope lists those
    /// replace the requested permissions, which may be stale.
    pub fn from_web_bundle(
        requested_permissions: &[String],
        bundle: &AuthBundle,
        source: AccessTokenSource,
    ) -> Self {
        let expires = bundle_seconds_as_date(bundle, EXPIRES_IN_KEY, Some(Utc::now()));
        let token = bundle.get(ACCESS_TOKEN_KEY).cloned().unwrap_or_default();

        let granted = match bundle.get(GRANTED_SCOPES_KEY) {
            Some(scopes) if !scopes.is_empty() => split_scopes(Some(scopes)),
            _ => requested_permissions.iter().cloned().collect(),
        };
        let declined = split_scopes(bundle.get(DENIED_SCOPES_KEY));

        Self::create(granted, declined, token, expires, source)
    }

    /// Create a token from a refresh result, carrying over the current
    /// token's permissions and source.
    ///
    /// Only app-sourced tokens support refresh; refresh results return the
    /// expiry in seconds from the epoch rather than seconds from now.
    pub fn from_refresh(current: &AccessToken, bundle: &AuthBundle) -> Self {
        debug_assert!(current.source.can_extend_token());

        let expires = bundle_seconds_as_date(bundle, EXPIRES_IN_KEY, DateTime::UNIX_EPOCH);
        let token = bundle.get(ACCESS_TOKEN_KEY).cloned().unwrap_or_default();

        Self::create(
            current.permissions.clone(),
            current.declined_permissions.clone(),
            token,
            expires,
            current.source,
        )
    }

    /// Copy of this token with refreshed permission sets (same credential).
    pub fn with_refreshed_permissions(
        &self,
        granted: impl IntoIterator<Item = String>,
        declined: impl IntoIterator<Item = String>,
    ) -> Self {
        Self::new(
            self.token.clone(),
            self.expires,
            granted.into_iter().collect(),
            declined.into_iter().collect(),
            self.source,
            self.last_refresh,
        )
    }

    /// Restore a token from a persisted cache bundle.
    pub fn from_cache_bundle(bundle: &TokenBundle) -> Self {
        Self::new(
            bundle.token.clone(),
            millis_to_date(bundle.expires_at),
            bundle.permissions.iter().cloned().collect(),
            bundle.declined_permissions.iter().cloned().collect(),
            bundle.source,
            millis_to_date(bundle.last_refresh_at),
        )
    }

    /// Snapshot this token into a persistable cache bundle.
    pub fn to_cache_bundle(&self) -> TokenBundle {
        TokenBundle {
            schema_version: store::CURRENT_SCHEMA_VERSION,
            token: self.token.clone(),
            expires_at: date_to_millis(self.expires),
            permissions: self.permissions.iter().cloned().collect(),
            declined_permissions: self.declined_permissions.iter().cloned().collect(),
            source: self.source,
            last_refresh_at: date_to_millis(self.last_refresh),
        }
    }

    fn create(
        granted: BTreeSet<String>,
        declined: BTreeSet<String>,
        token: String,
        expires: Option<DateTime<Utc>>,
        source: AccessTokenSource,
    ) -> Self {
        match expires {
            Some(expires) if !token.is_empty() => {
                Self::new(token, expires, granted, declined, source, Utc::now())
            }
            _ => Self::empty(),
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &config::loggable_token(&self.token))
            .field("expires", &self.expires)
            .field("permissions", &self.permissions)
            .field("source", &self.source)
            .finish()
    }
}

/// Convert a bundle value holding a number of seconds into an absolute time.
///
/// A value of exactly `0` means "never expires" and maps to the maximum
/// representable timestamp, not a past instant. A missing base means the
/// seconds cannot be interpreted and yields `None`, which factory paths
/// degrade to the empty token.
fn bundle_seconds_as_date(
    bundle: &AuthBundle,
    key: &str,
    base: impl Into<Option<DateTime<Utc>>>,
) -> Option<DateTime<Utc>> {
    let base = base.into()?;
    let seconds: i64 = bundle.get(key)?.parse().ok()?;

    if seconds == 0 {
        Some(DateTime::<Utc>::MAX_UTC)
    } else {
        base.checked_add_signed(Duration::seconds(seconds))
            .or(Some(DateTime::<Utc>::MAX_UTC))
    }
}

fn split_scopes(value: Option<&String>) -> BTreeSet<String> {
    match value {
        Some(s) if !s.is_empty() => s.split(',').map(|p| p.trim().to_string()).collect(),
        _ => BTreeSet::new(),
    }
}

fn millis_to_date(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn date_to_millis(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(entries: &[(&str, &str)]) -> AuthBundle {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_token_is_invalid() {
        let token = AccessToken::empty();
        assert!(token.is_invalid());
        assert_eq!(token.token(), "");
        assert_eq!(token.source(), AccessTokenSource::None);
    }

    #[test]
    fn test_is_invalid_iff_empty_or_expired() {
        let now = Utc::now();

        let valid = AccessToken::from_existing("tok", Some(now + Duration::hours(1)), None, None, []);
        assert!(!valid.is_invalid_at(now));

        let expired = AccessToken::from_existing("tok", Some(now - Duration::seconds(1)), None, None, []);
        assert!(expired.is_invalid_at(now));

        let empty_string =
            AccessToken::from_existing("", Some(now + Duration::hours(1)), None, None, []);
        assert!(empty_string.is_invalid_at(now));
    }

    #[test]
    fn test_expiry_zero_means_never_expires() {
        let b = bundle(&[(ACCESS_TOKEN_KEY, "tok"), (EXPIRES_IN_KEY, "0")]);
        let token = AccessToken::from_web_bundle(&[], &b, AccessTokenSource::WebView);
        assert_eq!(token.expires(), DateTime::<Utc>::MAX_UTC);
        assert!(!token.is_invalid());
    }

    #[test]
    fn test_web_bundle_granted_scopes_override_requested() {
        let b = bundle(&[
            (ACCESS_TOKEN_KEY, "tok"),
            (EXPIRES_IN_KEY, "3600"),
            (GRANTED_SCOPES_KEY, "email,user_friends"),
            (DENIED_SCOPES_KEY, "publish_actions"),
        ]);
        let requested = vec!["email".to_string(), "publish_actions".to_string()];
        let token = AccessToken::from_web_bundle(&requested, &b, AccessTokenSource::AppWeb);

        assert!(token.permissions().contains("email"));
        assert!(token.permissions().contains("user_friends"));
        assert!(!token.permissions().contains("publish_actions"));
        assert!(token.declined_permissions().contains("publish_actions"));
    }

    #[test]
    fn test_missing_token_degrades_to_empty() {
        let b = bundle(&[(EXPIRES_IN_KEY, "3600")]);
        let token = AccessToken::from_web_bundle(&[], &b, AccessTokenSource::WebView);
        assert!(token.is_invalid());
        assert_eq!(token.token(), "");
    }

    #[test]
    fn test_malformed_expiry_degrades_to_empty() {
        let b = bundle(&[(ACCESS_TOKEN_KEY, "tok"), (EXPIRES_IN_KEY, "not-a-number")]);
        let token = AccessToken::from_web_bundle(&[], &b, AccessTokenSource::WebView);
        assert!(token.is_invalid());
    }

    #[test]
    fn test_refresh_preserves_permissions() {
        let current = AccessToken::from_existing(
            "old",
            Some(Utc::now() + Duration::hours(1)),
            None,
            Some(AccessTokenSource::AppWeb),
            vec!["email".to_string(), "user_friends".to_string()],
        );

        let epoch_expiry = (Utc::now() + Duration::days(60)).timestamp().to_string();
        let b = bundle(&[(ACCESS_TOKEN_KEY, "new"), (EXPIRES_IN_KEY, epoch_expiry.as_str())]);

        let refreshed = AccessToken::from_refresh(&current, &b);
        assert_eq!(refreshed.token(), "new");
        assert_eq!(refreshed.permissions(), current.permissions());
        assert_eq!(refreshed.source(), AccessTokenSource::AppWeb);
        assert!(!refreshed.is_invalid());
    }

    #[test]
    fn test_source_extension_support() {
        assert!(AccessTokenSource::AppWeb.can_extend_token());
        assert!(AccessTokenSource::AppNative.can_extend_token());
        assert!(AccessTokenSource::AppService.can_extend_token());
        assert!(!AccessTokenSource::WebView.can_extend_token());
        assert!(!AccessTokenSource::None.can_extend_token());
    }

    #[test]
    fn test_cache_bundle_round_trip() {
        let token = AccessToken::from_existing(
            "cached",
            Some(Utc::now() + Duration::hours(2)),
            Some(Utc::now()),
            Some(AccessTokenSource::AppNative),
            vec!["email".to_string()],
        );

        let restored = AccessToken::from_cache_bundle(&token.to_cache_bundle());
        assert_eq!(restored.token(), "cached");
        assert_eq!(restored.source(), AccessTokenSource::AppNative);
        assert!(restored.permissions().contains("email"));
        assert!(!restored.is_invalid());
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AccessToken::from_existing("secret-token", None, None, None, []);
        let debug = format!("{:?}", token);
        if !config::is_logging_behavior_enabled(config::LoggingBehavior::IncludeAccessTokens) {
            assert!(!debug.contains("secret-token"));
        }
    }
}
