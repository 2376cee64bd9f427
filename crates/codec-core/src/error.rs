//! Error handling for the frame codec
//!
//! Every failure here is a property of a single payload: the codec holds no
//! connection state, so callers decide whether a bad frame is droppable or
//! fatal.

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors produced while decoding, converting or re-encoding audio payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload was not valid base64
    #[error("Invalid base64 payload: {details}")]
    InvalidBase64 { details: String },

    /// Payload bytes do not fit the declared encoding
    #[error("Invalid payload data: {details}")]
    InvalidPayload { details: String },

    /// Unsupported audio format or format combination
    #[error("Unsupported audio format: {format}")]
    UnsupportedFormat { format: String },

    /// Invalid sample rate
    #[error("Invalid sample rate: {rate}Hz (supported: {supported:?})")]
    InvalidSampleRate { rate: u32, supported: Vec<u32> },

    /// Invalid frame size
    #[error("Invalid frame size: expected {expected}, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },
}

impl CodecError {
    /// Create a new invalid base64 error
    pub fn invalid_base64(details: impl Into<String>) -> Self {
        Self::InvalidBase64 {
            details: details.into(),
        }
    }

    /// Create a new invalid payload error
    pub fn invalid_payload(details: impl Into<String>) -> Self {
        Self::InvalidPayload {
            details: details.into(),
        }
    }

    /// Create a new unsupported format error
    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    /// Whether the error describes a single bad payload that can be skipped
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidBase64 { .. } | Self::InvalidPayload { .. } | Self::InvalidFrameSize { .. }
        )
    }
}
