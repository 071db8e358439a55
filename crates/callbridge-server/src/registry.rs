//! Session Registry: live call sessions by stream id.
//!
//! This is the only state shared across call workers. The gateway's read loop
//! inserts and looks up, each session removes itself on close, and the
//! periodic sweep evicts anything that failed to.

use crate::session::SessionHandle;
use callbridge_types::CallState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stream {0} already has a live session")]
    Duplicate(String),
}

/// Snapshot of one live session for the inspection route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub stream_id: String,
    pub call_id: String,
    pub tenant_id: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

/// Concurrent map of stream id to session handle.
///
/// Uses `std::sync::RwLock`: every acquisition is a short map operation that
/// never spans an `.await`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. An existing entry is never replaced.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Duplicate` if the stream id is already taken.
    pub fn insert(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut sessions = self.write();
        if sessions.contains_key(handle.stream_id()) {
            return Err(RegistryError::Duplicate(handle.stream_id().to_string()));
        }
        sessions.insert(handle.stream_id().to_string(), handle);
        Ok(())
    }

    pub fn lookup(&self, stream_id: &str) -> Option<SessionHandle> {
        self.read().get(stream_id).cloned()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.read().contains_key(stream_id)
    }

    /// Removes the entry for `stream_id` only if it still belongs to
    /// `session_id`, so a late teardown can never evict a newer session that
    /// reused the stream id. Returns `true` if an entry was removed.
    pub fn remove(&self, stream_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.write();
        match sessions.get(stream_id) {
            Some(handle) if handle.session_id() == session_id => {
                sessions.remove(stream_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Live sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .read()
            .values()
            .map(|handle| SessionSummary {
                stream_id: handle.stream_id().to_string(),
                call_id: handle.call_id().to_string(),
                tenant_id: handle.tenant_id().to_string(),
                state: handle.state(),
                created_at: handle.created_at(),
            })
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        out
    }

    /// Evicts sessions that will not remove themselves: workers that exited
    /// without cleaning up, entries already `Closed`, sessions stuck in
    /// `Draining` for longer than `draining_after`, and `Starting` or `Active`
    /// sessions whose worker has made no progress for `unresponsive_after`.
    ///
    /// Evicted workers that are still running are told to close. Returns the
    /// evicted handles.
    pub fn sweep(
        &self,
        now: Instant,
        draining_after: Duration,
        unresponsive_after: Duration,
    ) -> Vec<SessionHandle> {
        let mut evicted = Vec::new();
        {
            let mut sessions = self.write();
            sessions.retain(|_, handle| {
                let status = handle.status();
                let stuck = match status.state {
                    CallState::Closed => true,
                    CallState::Draining => {
                        now.saturating_duration_since(status.since) >= draining_after
                    }
                    CallState::Starting | CallState::Active => {
                        now.saturating_duration_since(status.since) >= unresponsive_after
                            && now.saturating_duration_since(handle.last_progress())
                                >= unresponsive_after
                    }
                };
                let stale = !handle.worker_alive() || stuck;
                if stale {
                    evicted.push(handle.clone());
                }
                !stale
            });
        }
        for handle in &evicted {
            handle.force_close();
        }
        evicted
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
