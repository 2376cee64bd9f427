//! Process-wide map of live sessions
//!
//! The only state shared across sessions. Mutated on session creation and
//! teardown, read by status and metrics queries. Lookups clone the handle
//! out so no map guard outlives the call.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::errors::{Result, SessionError};
use crate::session::CallSession;
use crate::types::CallId;

#[derive(Debug)]
pub struct SessionRegistry<H = CallSession> {
    sessions: DashMap<CallId, H>,
}

impl<H: Clone> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> SessionRegistry<H> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a new session; an id that is already live is rejected and the
    /// existing entry left untouched
    pub fn create(&self, call_id: CallId, handle: H) -> Result<H> {
        match self.sessions.entry(call_id) {
            Entry::Occupied(entry) => Err(SessionError::already_exists(entry.key().as_str())),
            Entry::Vacant(entry) => {
                debug!(call_id = %entry.key(), "session registered");
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn get(&self, call_id: &CallId) -> Result<H> {
        self.sessions
            .get(call_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::not_found(call_id.as_str()))
    }

    /// Remove a session; absent ids are a no-op
    pub fn remove(&self, call_id: &CallId) -> Option<H> {
        let removed = self.sessions.remove(call_id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(call_id = %call_id, "session unregistered");
        }
        removed
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.sessions.contains_key(call_id)
    }

    pub fn snapshot_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn list_ids(&self) -> Vec<CallId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Clone of every live handle
    pub fn sessions(&self) -> Vec<H> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}
