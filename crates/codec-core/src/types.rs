//! Core audio types shared by the relay
//!
//! Telephony media is always 8 kHz mono G.711 in fixed 20 ms frames. The
//! speech engine accepts either G.711 at the same rate or 16-bit linear PCM
//! at 24 kHz; [`AudioFormat`] captures which one a session negotiated.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Telephony sample rate in Hz
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Engine sample rate for linear PCM in Hz
pub const PCM16_SAMPLE_RATE: u32 = 24000;

/// Duration of one telephony frame in milliseconds
pub const FRAME_DURATION_MS: u32 = 20;

/// Bytes in one 20 ms G.711 frame at 8 kHz
pub const TELEPHONY_FRAME_BYTES: usize = (TELEPHONY_SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

/// Sample encoding of an audio payload
///
/// Serialized names match the engine's `input_audio_format` /
/// `output_audio_format` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// G.711 μ-law (PCMU)
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    /// G.711 A-law (PCMA)
    #[serde(rename = "g711_alaw")]
    G711Alaw,
    /// 16-bit signed little-endian linear PCM
    #[serde(rename = "pcm16")]
    Pcm16,
}

impl AudioEncoding {
    /// Wire name used by the engine protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::G711Ulaw => "g711_ulaw",
            AudioEncoding::G711Alaw => "g711_alaw",
            AudioEncoding::Pcm16 => "pcm16",
        }
    }

    /// Bytes used to carry one sample
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::G711Ulaw | AudioEncoding::G711Alaw => 1,
            AudioEncoding::Pcm16 => 2,
        }
    }

    /// Sample rate the engine expects for this encoding
    pub fn native_sample_rate(&self) -> u32 {
        match self {
            AudioEncoding::G711Ulaw | AudioEncoding::G711Alaw => TELEPHONY_SAMPLE_RATE,
            AudioEncoding::Pcm16 => PCM16_SAMPLE_RATE,
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding plus sample rate of a payload stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    /// The fixed telephony media format (8 kHz μ-law)
    pub const TELEPHONY: AudioFormat = AudioFormat {
        encoding: AudioEncoding::G711Ulaw,
        sample_rate: TELEPHONY_SAMPLE_RATE,
    };

    /// Format the engine uses for the given encoding
    pub fn engine(encoding: AudioEncoding) -> Self {
        Self {
            encoding,
            sample_rate: encoding.native_sample_rate(),
        }
    }

    /// Number of payload bytes in `ms` milliseconds of audio
    pub fn bytes_for_duration(&self, ms: u32) -> usize {
        (self.sample_rate as usize * ms as usize / 1000) * self.encoding.bytes_per_sample()
    }

    /// Duration in milliseconds represented by `len` payload bytes
    pub fn duration_ms(&self, len: usize) -> u64 {
        let samples = len / self.encoding.bytes_per_sample();
        (samples as u64 * 1000) / self.sample_rate as u64
    }
}

/// Which way a frame travels through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Caller speech heading to the engine
    CallerToAgent,
    /// Agent speech heading to the caller
    AgentToCaller,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::CallerToAgent => f.write_str("caller->agent"),
            Direction::AgentToCaller => f.write_str("agent->caller"),
        }
    }
}

/// An immutable chunk of encoded audio
///
/// The payload is reference counted, so moving a frame through the relay
/// never copies audio bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub direction: Direction,
    pub payload: Bytes,
    /// Per-direction arrival sequence, diagnostics only
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(direction: Direction, payload: Bytes, sequence: u64) -> Self {
        Self {
            direction,
            payload,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
