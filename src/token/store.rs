// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistence of access tokens between process runs.
//!
//! A [`TokenBundle`] is the serialized form of an [`AccessToken`](super::AccessToken)
//! plus a schema version; [`TokenStore`] is the seam a session uses to load a
//! cached credential at construction, save it after every token change, and
//! clear it when the session is torn down. Two implementations ship with the
//! SDK: an in-memory store for tests and short-lived processes, and a file
//! store with atomic writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

use super::AccessTokenSource;

/// Current bundle schema version.
///
/// Version history:
/// - v1: token, expiry, permissions, source, last refresh
/// - v2: adds declined permissions
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Serialized access token.
///
/// Timestamps are milliseconds since the epoch so the payload stays readable
/// and stable across chrono versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub schema_version: u32,
    pub token: String,
    pub expires_at: i64,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub declined_permissions: Vec<String>,
    pub source: AccessTokenSource,
    pub last_refresh_at: i64,
}

impl TokenBundle {
    /// Parse a bundle from its JSON form, migrating older schema versions.
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_str(raw)?;
        let version = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::Corrupted("missing schema_version".to_string()))?
            as u32;

        match version {
            // v1 bundles predate declined permissions; serde's default fills
            // in the empty list.
            1 | 2 => {
                let mut bundle: TokenBundle = serde_json::from_value(value)?;
                bundle.schema_version = CURRENT_SCHEMA_VERSION;
                Ok(bundle)
            }
            other => Err(StoreError::UnsupportedSchemaVersion(other)),
        }
    }

    /// Serialize the bundle to its JSON form.
    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Credential cache used by sessions.
///
/// `load` returns `Ok(None)` when no bundle has been saved; corruption and
/// unsupported schema versions are errors so the caller can decide whether to
/// discard the cache.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<TokenBundle>, StoreError>;
    fn save(&self, bundle: &TokenBundle) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// Token store backed by process memory. Keyed so several sessions can share
/// one store in tests.
#[derive(Default)]
pub struct MemoryTokenStore {
    slots: Mutex<HashMap<String, TokenBundle>>,
    key: String,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::with_key("default")
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            key: key.into(),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<TokenBundle>, StoreError> {
        Ok(self.slots.lock().unwrap_or_else(|e| e.into_inner()).get(&self.key).cloned())
    }

    fn save(&self, bundle: &TokenBundle) -> Result<(), StoreError> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.key.clone(), bundle.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
        Ok(())
    }
}

/// Token store backed by a JSON file.
///
/// Saves go through a sibling temp file and rename so a crash mid-write never
/// leaves a truncated bundle behind.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The file this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<TokenBundle>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        TokenBundle::from_json(&raw).map(Some)
    }

    fn save(&self, bundle: &TokenBundle) -> Result<(), StoreError> {
        let json = bundle.to_json()?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
