//! Error types for call session orchestration
//!
//! Connection-level failures end up in a session's termination path;
//! function-level failures never leave the dispatcher and are reported to
//! the engine as structured results instead.

use crate::types::Peer;
use callrelay_codec_core::CodecError;
use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// A peer's connection closed or failed
    #[error("{peer} transport disconnected: {reason}")]
    TransportDisconnect { peer: Peer, reason: String },

    /// The engine connection could not be opened or configured
    #[error("Upstream handshake failed: {reason}")]
    UpstreamHandshakeFailure { reason: String },

    /// Malformed or unexpected message from a peer
    #[error("Protocol violation from {peer}: {details}")]
    ProtocolViolation { peer: Peer, details: String },

    /// A business function failed or timed out
    #[error("Function {function} failed: {details}")]
    FunctionExecutionError { function: String, details: String },

    /// A live session already exists for this call id
    #[error("Session already exists: {call_id}")]
    RegistryConflict { call_id: String },

    #[error("Session not found: {call_id}")]
    NotFound { call_id: String },

    /// Operation not valid in the session's current state
    #[error("Invalid state: {details}")]
    InvalidState { details: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl SessionError {
    pub fn disconnect(peer: Peer, reason: impl Into<String>) -> Self {
        Self::TransportDisconnect {
            peer,
            reason: reason.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::UpstreamHandshakeFailure {
            reason: reason.into(),
        }
    }

    pub fn protocol_violation(peer: Peer, details: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            peer,
            details: details.into(),
        }
    }

    pub fn function_failed(function: impl Into<String>, details: impl Into<String>) -> Self {
        Self::FunctionExecutionError {
            function: function.into(),
            details: details.into(),
        }
    }

    pub fn already_exists(call_id: impl Into<String>) -> Self {
        Self::RegistryConflict {
            call_id: call_id.into(),
        }
    }

    pub fn not_found(call_id: impl Into<String>) -> Self {
        Self::NotFound {
            call_id: call_id.into(),
        }
    }

    pub fn invalid_state(details: impl Into<String>) -> Self {
        Self::InvalidState {
            details: details.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error ends the session it occurred in
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TransportDisconnect { .. } | Self::UpstreamHandshakeFailure { .. }
        )
    }
}

impl From<callrelay_infra_common::Error> for SessionError {
    fn from(err: callrelay_infra_common::Error) -> Self {
        Self::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SessionError::already_exists("CA1");
        assert_eq!(err.to_string(), "Session already exists: CA1");

        let err = SessionError::protocol_violation(Peer::Telephony, "unknown event 'bogus'");
        assert_eq!(err.to_string(), "Protocol violation from telephony: unknown event 'bogus'");
    }

    #[test]
    fn test_fatality() {
        assert!(SessionError::disconnect(Peer::Engine, "eof").is_fatal());
        assert!(SessionError::handshake("401").is_fatal());
        assert!(!SessionError::protocol_violation(Peer::Engine, "bad json").is_fatal());
        assert!(!SessionError::function_failed("lookup_order", "timed out").is_fatal());
    }
}
