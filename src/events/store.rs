// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable fallback storage for buffered application events.
//!
//! Only one failure mode writes here: a flush that could not reach the
//! network at all. Those in-flight events are persisted keyed by their
//! credential/application pair and folded back into the in-memory buffers at
//! the start of the next flush. Every other failure drops the events, since
//! retrying them would risk duplicate submission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::AppEvent;

/// Events persisted for retry, keyed by the owning buffer's key string.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedPayload {
    events: HashMap<String, Vec<AppEvent>>,
}

/// Store for events awaiting a connectivity retry.
pub trait EventStore: Send + Sync {
    /// Append events under a key.
    fn persist(&self, key: &str, events: &[AppEvent]) -> Result<(), StoreError>;

    /// Take everything out of the store, leaving it empty.
    fn load_and_clear(&self) -> Result<HashMap<String, Vec<AppEvent>>, StoreError>;
}

/// In-memory event store, for tests and hosts without durable storage.
#[derive(Default)]
pub struct MemoryEventStore {
    payload: Mutex<HashMap<String, Vec<AppEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryEventStore {
    fn persist(&self, key: &str, events: &[AppEvent]) -> Result<(), StoreError> {
        self.payload
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    fn load_and_clear(&self) -> Result<HashMap<String, Vec<AppEvent>>, StoreError> {
        Ok(std::mem::take(
            &mut *self.payload.lock().unwrap_or_else(|e| e.into_inner()),
        ))
    }
}

/// JSON-file-backed event store with atomic writes.
pub struct FileEventStore {
    path: PathBuf,
}

impl FileEventStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read(&self) -> Result<PersistedPayload, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedPayload::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, payload: &PersistedPayload) -> Result<(), StoreError> {
        let json = serde_json::to_string(payload)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl EventStore for FileEventStore {
    fn persist(&self, key: &str, events: &[AppEvent]) -> Result<(), StoreError> {
        let mut payload = self.read()?;
        payload
            .events
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(events);
        self.write(&payload)
    }

    fn load_and_clear(&self) -> Result<HashMap<String, Vec<AppEvent>>, StoreError> {
        let payload = self.read()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(payload.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> AppEvent {
        AppEvent::new(name, None, Default::default(), false)
    }

    #[test]
    fn test_memory_store_accumulates_and_drains() {
        let store = MemoryEventStore::new();
        store.persist("key-a", &[event("one")]).unwrap();
        store.persist("key-a", &[event("two")]).unwrap();
        store.persist("key-b", &[event("three")]).unwrap();

        let drained = store.load_and_clear().unwrap();
        assert_eq!(drained["key-a"].len(), 2);
        assert_eq!(drained["key-b"].len(), 1);

        assert!(store.load_and_clear().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::new(dir.path().join("events.json"));

        store.persist("key", &[event("offline")]).unwrap();
        store.persist("key", &[event("still-offline")]).unwrap();

        let drained = store.load_and_clear().unwrap();
        assert_eq!(drained["key"].len(), 2);
        assert_eq!(drained["key"][0].name(), "offline");

        // Drained means gone.
        assert!(store.load_and_clear().unwrap().is_empty());
    }

    #[test]
    fn test_empty_file_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::new(dir.path().join("missing.json"));
        assert!(store.load_and_clear().unwrap().is_empty());
    }
}
