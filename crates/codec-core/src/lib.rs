//! # Codec-Core: telephony audio frame codec
//!
//! Audio plumbing for the call relay. Everything here is synchronous and
//! allocation-light so it can run inline on the relay tasks.
//!
//! - **G.711 (PCMU/PCMA)**: ITU-T reference companding plus lookup tables
//! - **Framing**: base64 payload wrapping and 20 ms frame re-cutting
//! - **Conversion**: telephony format to and from the engine's audio format, with a phase-keeping resampler for streamed agent audio
//! - **VAD**: optional energy detector for relay-side turn-taking
//!
//! ## Usage
//!
//! ```rust
//! use callrelay_codec_core::{AudioEncoding, AudioFormat, FrameCodec, decode_payload};
//!
//! let codec = FrameCodec::new(AudioFormat::engine(AudioEncoding::Pcm16))?;
//! let frame = decode_payload("//////////8=")?;
//! let engine_audio = codec.telephony_to_engine(frame)?;
//! assert_eq!(engine_audio.len(), 8 * 3 * 2);
//! # Ok::<(), callrelay_codec_core::CodecError>(())
//! ```

pub mod convert;
pub mod error;
pub mod framing;
pub mod g711;
pub mod types;
pub mod vad;

pub use convert::{AgentAudioStream, FrameCodec, Resampler};
pub use error::{CodecError, Result};
pub use framing::{FrameSplitter, decode_payload, encode_payload};
pub use types::{
    AudioEncoding, AudioFormat, AudioFrame, Direction, FRAME_DURATION_MS, PCM16_SAMPLE_RATE,
    TELEPHONY_FRAME_BYTES, TELEPHONY_SAMPLE_RATE,
};
pub use vad::{EnergyVad, EnergyVadConfig, VadTransition};

/// Version information for the codec library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
