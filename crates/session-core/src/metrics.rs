//! Point-in-time counts across all live sessions

use serde::Serialize;

use crate::registry::SessionRegistry;
use crate::types::CallState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Sessions in the registry, whatever their state
    pub active_sessions: usize,
    /// Sessions holding an open engine connection
    pub engine_connections: usize,
    /// Sessions waiting on at least one function result
    pub function_pending_sessions: usize,
    /// Sessions flushing agent audio after a barge-in
    pub interrupted_sessions: usize,
}

impl MetricsSnapshot {
    pub fn from_registry(registry: &SessionRegistry) -> Self {
        let sessions = registry.sessions();
        let mut metrics = Self {
            active_sessions: sessions.len(),
            ..Self::default()
        };
        for session in sessions {
            let snapshot = session.snapshot();
            if snapshot.engine_connected {
                metrics.engine_connections += 1;
            }
            if snapshot.is_function_pending() {
                metrics.function_pending_sessions += 1;
            }
            if snapshot.state == CallState::Interrupted {
                metrics.interrupted_sessions += 1;
            }
        }
        metrics
    }
}
