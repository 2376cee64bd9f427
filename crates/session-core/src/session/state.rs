//! Mutable per-session state
//!
//! One [`SessionState`] per call, guarded by a single `parking_lot::Mutex`
//! in the session's shared block. Every mutation goes through that lock and
//! the lock is never held across an `.await`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::{CallId, CallState, CallSummary, CallerMetadata, Peer, SessionSnapshot, TerminationReason};

/// A function call awaiting its result
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFunction {
    pub name: String,
    pub arguments: String,
    pub issued_at: DateTime<Utc>,
}

/// Per-direction frame counts, for diagnostics only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Media frames decoded from the caller
    pub from_caller: u64,
    /// Append events sent to the engine
    pub to_engine: u64,
    /// Telephony-sized frames cut from engine audio
    pub from_engine: u64,
    /// Media events sent to the caller
    pub to_caller: u64,
    /// Agent frames discarded by barge-in
    pub flushed: u64,
}

#[derive(Debug)]
pub struct SessionState {
    pub call_id: CallId,
    pub caller: CallerMetadata,
    pub state: CallState,
    /// Agent audio is queued for or playing to the caller
    pub outbound_audio: bool,
    /// Bumped on every barge-in; agent frames from older generations are stale
    pub generation: u64,
    /// The engine is generating a response
    pub response_active: bool,
    pub pending: HashMap<String, PendingFunction>,
    pub stream_sid: Option<String>,
    pub engine_connected: bool,
    pub telephony_attached: bool,
    pub counters: FrameCounters,
    pub functions_issued: u64,
    pub interruptions: u64,
    /// Mark sent after the last queued response; its echo means playback ended
    pub pending_mark: Option<String>,
    mark_seq: u64,
    telephony_violations: u32,
    engine_violations: u32,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub reason: Option<TerminationReason>,
}

impl SessionState {
    pub fn new(call_id: CallId, caller: CallerMetadata) -> Self {
        let stream_sid = caller.stream_sid.clone();
        Self {
            call_id,
            caller,
            state: CallState::Initiating,
            outbound_audio: false,
            generation: 0,
            response_active: false,
            pending: HashMap::new(),
            stream_sid,
            engine_connected: false,
            telephony_attached: false,
            counters: FrameCounters::default(),
            functions_issued: 0,
            interruptions: 0,
            pending_mark: None,
            mark_seq: 0,
            telephony_violations: 0,
            engine_violations: 0,
            created_at: Utc::now(),
            terminated_at: None,
            reason: None,
        }
    }

    /// Apply a state transition if the state machine allows it
    ///
    /// Illegal requests are logged and ignored. Returns the previous state
    /// on success.
    pub fn transition(&mut self, next: CallState) -> Option<CallState> {
        if !self.state.can_transition_to(next) {
            if self.state != next {
                warn!(call_id = %self.call_id, from = %self.state, to = %next, "ignoring illegal state transition");
            }
            return None;
        }
        let previous = self.state;
        self.state = next;
        Some(previous)
    }

    /// Enter `Terminating`, recording the first reason only
    pub fn begin_termination(&mut self, reason: TerminationReason) -> bool {
        if self.state.is_ending() || self.transition(CallState::Terminating).is_none() {
            return false;
        }
        self.reason = Some(reason);
        self.terminated_at = Some(Utc::now());
        true
    }

    /// Name for the next playback mark
    pub fn next_mark(&mut self) -> String {
        self.mark_seq += 1;
        let name = format!("response-{}", self.mark_seq);
        self.pending_mark = Some(name.clone());
        name
    }

    /// Count a malformed message; returns the consecutive count for that peer
    pub fn record_violation(&mut self, peer: Peer) -> u32 {
        let counter = match peer {
            Peer::Telephony => &mut self.telephony_violations,
            Peer::Engine => &mut self.engine_violations,
        };
        *counter += 1;
        *counter
    }

    /// Reset the consecutive violation count after a good message
    pub fn clear_violations(&mut self, peer: Peer) {
        match peer {
            Peer::Telephony => self.telephony_violations = 0,
            Peer::Engine => self.engine_violations = 0,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id.clone(),
            state: self.state,
            outbound_audio: self.outbound_audio,
            pending_functions: self.pending.len(),
            engine_connected: self.engine_connected,
            telephony_attached: self.telephony_attached,
            stream_sid: self.stream_sid.clone(),
            frames_from_caller: self.counters.from_caller,
            created_at: self.created_at,
            terminated_at: self.terminated_at,
            termination_reason: self.reason.clone(),
        }
    }

    pub fn summary(&self, dropped_to_engine: u64, dropped_to_caller: u64) -> CallSummary {
        let end = self.terminated_at.unwrap_or_else(Utc::now);
        let duration_secs = (end - self.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        CallSummary {
            call_id: self.call_id.clone(),
            duration_secs,
            frames_from_caller: self.counters.from_caller,
            frames_to_engine: self.counters.to_engine,
            frames_from_engine: self.counters.from_engine,
            frames_to_caller: self.counters.to_caller,
            dropped_to_engine,
            dropped_to_caller: dropped_to_caller + self.counters.flushed,
            functions_issued: self.functions_issued,
            interruptions: self.interruptions,
            reason: self.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(CallId::new("CA1"), CallerMetadata::default())
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut s = state();
        assert_eq!(s.transition(CallState::Active), None);
        assert_eq!(s.state, CallState::Initiating);
        assert_eq!(s.transition(CallState::Negotiating), Some(CallState::Initiating));
    }

    #[test]
    fn test_termination_is_idempotent() {
        let mut s = state();
        assert!(s.begin_termination(TerminationReason::TelephonyClosed));
        assert!(!s.begin_termination(TerminationReason::EngineClosed));
        assert_eq!(s.reason, Some(TerminationReason::TelephonyClosed));
        assert!(s.terminated_at.is_some());
    }

    #[test]
    fn test_violation_counts_are_per_peer() {
        let mut s = state();
        assert_eq!(s.record_violation(Peer::Telephony), 1);
        assert_eq!(s.record_violation(Peer::Telephony), 2);
        assert_eq!(s.record_violation(Peer::Engine), 1);
        s.clear_violations(Peer::Telephony);
        assert_eq!(s.record_violation(Peer::Telephony), 1);
    }

    #[test]
    fn test_marks_are_sequential() {
        let mut s = state();
        assert_eq!(s.next_mark(), "response-1");
        assert_eq!(s.next_mark(), "response-2");
        assert_eq!(s.pending_mark.as_deref(), Some("response-2"));
    }
}
