// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide shared state.
//!
//! One global context holds the active session, the shared HTTP client, the
//! per-credential event buffers, and the single-flight flush flag. The
//! context is established lazily on first use and lives until process exit.
//! A global lock guards each shared map; the per-session lock inside
//! [`Session`] is separate, and nothing here is held across an observer call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::events::{EventStore, MemoryEventStore, SessionEventsState};
use crate::session::Session;

static CONTEXT: Lazy<SdkContext> = Lazy::new(SdkContext::new);

static ANONYMOUS_ID: Lazy<String> = Lazy::new(|| uuid::Uuid::new_v4().to_string());

/// Stable per-process anonymous identifier, attached to event uploads so the
/// backend can correlate credential-less activity.
pub fn anonymous_id() -> &'static str {
    &ANONYMOUS_ID
}

/// What happened to the process-wide active session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSessionEvent {
    /// The previous active session was unset.
    Unset,
    /// A new active session was installed.
    Set,
    /// The newly installed active session is already open.
    Opened,
}

/// Observer of active-session changes.
pub type ActiveSessionObserver = Arc<dyn Fn(ActiveSessionEvent, Option<&Session>) + Send + Sync>;

struct SdkContext {
    active_session: Mutex<Option<Session>>,
    active_observers: Mutex<Vec<ActiveSessionObserver>>,
    http_client: reqwest::Client,
    event_states: Mutex<HashMap<String, Arc<Mutex<SessionEventsState>>>>,
    event_store: Mutex<Arc<dyn EventStore>>,
    flush_in_flight: Mutex<bool>,
}

impl SdkContext {
    fn new() -> Self {
        Self {
            active_session: Mutex::new(None),
            active_observers: Mutex::new(Vec::new()),
            http_client: reqwest::Client::new(),
            event_states: Mutex::new(HashMap::new()),
            event_store: Mutex::new(Arc::new(MemoryEventStore::new())),
            flush_in_flight: Mutex::new(false),
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The shared HTTP client all SDK calls go through.
pub fn http_client() -> &'static reqwest::Client {
    &CONTEXT.http_client
}

// ============================================================
// Active session
// ============================================================

/// The process-wide active session, if any.
pub fn active_session() -> Option<Session> {
    lock(&CONTEXT.active_session).clone()
}

/// Install a new active session.
///
/// The previous active session (if different) is closed as a side effect,
/// though its persisted token is left intact. Observers hear `Unset`, then
/// `Set`, then `Opened` when the new session is already open.
pub fn set_active_session(session: Session) {
    let previous = {
        let mut slot = lock(&CONTEXT.active_session);
        if slot.as_ref().is_some_and(|s| s.same_session(&session)) {
            return;
        }
        slot.replace(session.clone())
    };

    if let Some(previous) = previous {
        notify_active(ActiveSessionEvent::Unset, Some(&previous));
        previous.close();
    }
    notify_active(ActiveSessionEvent::Set, Some(&session));
    if session.is_opened() {
        notify_active(ActiveSessionEvent::Opened, Some(&session));
    }
}

/// Remove the active session, closing it.
pub fn clear_active_session() {
    let previous = lock(&CONTEXT.active_session).take();
    if let Some(previous) = previous {
        notify_active(ActiveSessionEvent::Unset, Some(&previous));
        previous.close();
    }
}

pub fn add_active_session_observer(observer: ActiveSessionObserver) {
    lock(&CONTEXT.active_observers).push(observer);
}

fn notify_active(event: ActiveSessionEvent, session: Option<&Session>) {
    let observers = lock(&CONTEXT.active_observers).clone();
    for observer in observers {
        observer(event, session);
    }
}

// ============================================================
// Event buffers
// ============================================================

/// The shared event buffer for a storage key, created on first use.
pub fn events_state_for(key: &str) -> Arc<Mutex<SessionEventsState>> {
    lock(&CONTEXT.event_states)
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(SessionEventsState::new())))
        .clone()
}

/// Snapshot of every event buffer.
pub fn all_event_states() -> Vec<(String, Arc<Mutex<SessionEventsState>>)> {
    lock(&CONTEXT.event_states)
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The store that holds events awaiting a connectivity retry.
pub fn event_store() -> Arc<dyn EventStore> {
    lock(&CONTEXT.event_store).clone()
}

/// Replace the connectivity-retry event store (e.g. with a file-backed one).
pub fn set_event_store(store: Arc<dyn EventStore>) {
    *lock(&CONTEXT.event_store) = store;
}

/// Claim the single flush slot. Returns false when a flush is already in
/// flight, in which case the caller must not flush (and must not call
/// [`end_flush`]).
pub fn try_begin_flush() -> bool {
    let mut in_flight = lock(&CONTEXT.flush_in_flight);
    if *in_flight {
        false
    } else {
        *in_flight = true;
        true
    }
}

/// Release the flush slot.
pub fn end_flush() {
    *lock(&CONTEXT.flush_in_flight) = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryTokenStore;

    #[test]
    fn test_flush_slot_is_single_flight() {
        // Drain any leftover claim from another test in this process.
        end_flush();

        assert!(try_begin_flush());
        assert!(!try_begin_flush());
        end_flush();
        assert!(try_begin_flush());
        end_flush();
    }

    #[test]
    fn test_events_state_is_shared_per_key() {
        let a = events_state_for("shared-key-test");
        let b = events_state_for("shared-key-test");
        assert!(Arc::ptr_eq(&a, &b));

        let other = events_state_for("different-key-test");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    // The active-session slot is process-global, so its behaviors are
    // exercised in one sequential test.
    #[test]
    fn test_active_session_slot() {
        let first = Session::new("app-ctx-1", Arc::new(MemoryTokenStore::new()), None);
        let second = Session::new("app-ctx-2", Arc::new(MemoryTokenStore::new()), None);

        set_active_session(first.clone());
        // Re-installing the same session changes nothing.
        set_active_session(first.clone());
        assert!(!first.is_closed());

        // Installing a different session closes the previous one.
        set_active_session(second.clone());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(active_session().unwrap().same_session(&second));

        clear_active_session();
        assert!(second.is_closed());
        assert!(active_session().is_none());
    }
}
