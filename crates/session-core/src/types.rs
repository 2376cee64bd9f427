//! Core types shared by the session components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Externally assigned identifier of one telephone call
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id for streams that arrive without one
    pub fn generate() -> Self {
        Self(format!("call-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What the inbound-call collaborator knows about the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerMetadata {
    pub from: Option<String>,
    pub to: Option<String>,
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

/// One side of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peer {
    Telephony,
    Engine,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Telephony => f.write_str("telephony"),
            Peer::Engine => f.write_str("engine"),
        }
    }
}

/// Call session lifecycle state
///
/// Pending function calls are an overlay on `Active`/`Interrupted`, tracked
/// by the session's pending map rather than a separate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Registry entry created, engine connection not yet open
    Initiating,
    /// Engine connection open, session parameters being configured
    Negotiating,
    /// Duplex relay running
    Active,
    /// Caller barged in; agent audio is being flushed
    Interrupted,
    /// Teardown in progress
    Terminating,
    /// Connections closed, registry entry removed
    Closed,
}

impl CallState {
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Initiating, Negotiating) => true,
            (Negotiating, Active) => true,
            (Active, Interrupted) => true,
            (Interrupted, Active) => true,
            (Terminating, Closed) => true,
            (Terminating | Closed, Terminating) => false,
            (_, Terminating) => true,
            _ => false,
        }
    }

    /// Audio flows only in these states
    pub fn is_relaying(&self) -> bool {
        matches!(self, CallState::Active | CallState::Interrupted)
    }

    /// Terminating or closed
    pub fn is_ending(&self) -> bool {
        matches!(self, CallState::Terminating | CallState::Closed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Initiating => "INITIATING",
            CallState::Negotiating => "NEGOTIATING",
            CallState::Active => "ACTIVE",
            CallState::Interrupted => "INTERRUPTED",
            CallState::Terminating => "TERMINATING",
            CallState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "details")]
pub enum TerminationReason {
    /// Telephony connection closed without a stop event
    TelephonyClosed,
    /// Telephony sent `stop`
    TelephonyStopped,
    EngineClosed,
    /// Engine connection could not be established
    UpstreamUnavailable,
    /// Engine never acknowledged the session configuration
    NegotiationTimeout,
    /// Too many consecutive malformed messages from one peer
    ProtocolViolation(String),
    /// External hangup request
    Hangup,
    /// Orchestrator shutting down
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::TelephonyClosed => f.write_str("telephony closed"),
            TerminationReason::TelephonyStopped => f.write_str("telephony stopped"),
            TerminationReason::EngineClosed => f.write_str("engine closed"),
            TerminationReason::UpstreamUnavailable => f.write_str("upstream unavailable"),
            TerminationReason::NegotiationTimeout => f.write_str("negotiation timeout"),
            TerminationReason::ProtocolViolation(d) => write!(f, "protocol violation: {}", d),
            TerminationReason::Hangup => f.write_str("hangup"),
            TerminationReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Who said something in a transcript event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Agent,
}

/// Point-in-time view of one session for status queries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub state: CallState,
    pub outbound_audio: bool,
    pub pending_functions: usize,
    pub engine_connected: bool,
    pub telephony_attached: bool,
    pub stream_sid: Option<String>,
    /// Caller frames received so far, relayed or not
    pub frames_from_caller: u64,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
}

impl SessionSnapshot {
    /// The function-pending overlay
    pub fn is_function_pending(&self) -> bool {
        self.pending_functions > 0
    }
}

/// Totals reported when a session closes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSummary {
    pub call_id: CallId,
    pub duration_secs: f64,
    pub frames_from_caller: u64,
    pub frames_to_engine: u64,
    pub frames_from_engine: u64,
    pub frames_to_caller: u64,
    /// Caller frames evicted from a full queue
    pub dropped_to_engine: u64,
    /// Agent frames evicted from a full queue or discarded by barge-in
    pub dropped_to_caller: u64,
    pub functions_issued: u64,
    pub interruptions: u64,
    pub reason: Option<TerminationReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallState::*;

    const ALL: [CallState; 6] = [Initiating, Negotiating, Active, Interrupted, Terminating, Closed];

    #[test]
    fn test_forward_path() {
        assert!(Initiating.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Active));
        assert!(Active.can_transition_to(Interrupted));
        assert!(Interrupted.can_transition_to(Active));
        assert!(Terminating.can_transition_to(Closed));
    }

    #[test]
    fn test_any_live_state_can_terminate() {
        for state in [Initiating, Negotiating, Active, Interrupted] {
            assert!(state.can_transition_to(Terminating), "{} -> TERMINATING", state);
        }
        assert!(!Terminating.can_transition_to(Terminating));
        assert!(!Closed.can_transition_to(Terminating));
    }

    #[test]
    fn test_closed_is_terminal() {
        for state in ALL {
            assert!(!Closed.can_transition_to(state));
        }
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Initiating.can_transition_to(Active));
        assert!(!Negotiating.can_transition_to(Interrupted));
        assert!(!Active.can_transition_to(Closed));
        assert!(!Interrupted.can_transition_to(Negotiating));
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_value(TerminationReason::ProtocolViolation("bad frames".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "protocol_violation", "details": "bad frames"}));
        let json = serde_json::to_value(TerminationReason::Hangup).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "hangup"}));
    }
}
