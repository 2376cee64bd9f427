//! Conversion between the telephony media format and the engine format
//!
//! When the engine speaks G.711 μ-law (the common Twilio setup) frames pass
//! through untouched. A-law is transcoded byte-for-byte. Linear PCM at
//! 24 kHz requires expansion plus a 3:1 rate change in either direction.

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::g711::{self, tables};
use crate::types::{AudioEncoding, AudioFormat, TELEPHONY_SAMPLE_RATE};

/// Decode little-endian 16-bit PCM bytes into samples
pub fn pcm16_le_to_samples(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::invalid_payload(format!(
            "odd byte count {} for pcm16",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode samples as little-endian 16-bit PCM bytes
pub fn samples_to_pcm16_le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Linear-interpolation resampler
///
/// Good enough for speech between 8 kHz and 24 kHz; the engine does its own
/// filtering on input and telephony band-limits the output anyway.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            let a = samples[idx.min(last)] as f64;
            let b = samples[(idx + 1).min(last)] as f64;
            (a + (b - a) * frac).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

/// Linear resampler that carries its phase across chunks
///
/// Positions are kept as exact fractions of an input sample (units of
/// `1 / to_rate`), so a stream of chunks of any length produces the same
/// output as one long chunk, apart from one held-back input sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    /// Next output position relative to the start of the pending buffer
    position: u64,
    /// Last input sample of the previous chunk, first in the next buffer
    held: Option<i16>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            position: 0,
            held: None,
        }
    }

    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        if self.from_rate == self.to_rate {
            return samples.to_vec();
        }
        let mut buf = Vec::with_capacity(samples.len() + 1);
        buf.extend(self.held);
        buf.extend_from_slice(samples);
        if buf.len() < 2 {
            self.held = buf.last().copied();
            return Vec::new();
        }

        let to = self.to_rate as u64;
        let step = self.from_rate as u64;
        let mut out = Vec::with_capacity(samples.len() * self.to_rate as usize / self.from_rate as usize + 1);
        loop {
            let idx = (self.position / to) as usize;
            if idx + 1 >= buf.len() {
                break;
            }
            let frac = (self.position % to) as f64 / to as f64;
            let a = buf[idx] as f64;
            let b = buf[idx + 1] as f64;
            out.push((a + (b - a) * frac).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
            self.position += step;
        }

        let consumed = (buf.len() - 1) as u64;
        self.position -= consumed * to;
        self.held = buf.last().copied();
        out
    }

    /// Forget buffered input, e.g. when the stream is cut off
    pub fn reset(&mut self) {
        self.position = 0;
        self.held = None;
    }
}

/// Engine-to-telephony conversion for one continuous agent audio stream
///
/// Unlike [`FrameCodec::engine_to_telephony`], a rate change keeps its
/// phase between engine chunks, so chunk sizes that are not a multiple of
/// the rate ratio neither lose samples nor drift.
#[derive(Debug, Clone)]
pub struct AgentAudioStream {
    codec: FrameCodec,
    resampler: Resampler,
}

impl AgentAudioStream {
    pub fn new(codec: FrameCodec) -> Self {
        let resampler = Resampler::new(codec.engine.sample_rate, codec.telephony.sample_rate);
        Self { codec, resampler }
    }

    pub fn convert(&mut self, payload: Bytes) -> Result<Bytes> {
        if self.codec.is_passthrough() {
            return Ok(payload);
        }
        let samples = match self.codec.engine.encoding {
            AudioEncoding::Pcm16 => pcm16_le_to_samples(&payload)?,
            encoding => decode_g711(encoding, &payload),
        };
        let resampled = self.resampler.process(&samples);
        Ok(Bytes::from(encode_samples(self.codec.telephony.encoding, &resampled)))
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

/// Stateless converter for one negotiated session format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    telephony: AudioFormat,
    engine: AudioFormat,
}

impl FrameCodec {
    /// Build a converter from the telephony format to the given engine format
    pub fn new(engine: AudioFormat) -> Result<Self> {
        Self::with_formats(AudioFormat::TELEPHONY, engine)
    }

    pub fn with_formats(telephony: AudioFormat, engine: AudioFormat) -> Result<Self> {
        if telephony.encoding == AudioEncoding::Pcm16 || telephony.sample_rate != TELEPHONY_SAMPLE_RATE {
            return Err(CodecError::unsupported_format(format!(
                "telephony side must be 8 kHz G.711, got {} at {} Hz",
                telephony.encoding, telephony.sample_rate
            )));
        }
        if engine.encoding != AudioEncoding::Pcm16 && engine.sample_rate != TELEPHONY_SAMPLE_RATE {
            return Err(CodecError::InvalidSampleRate {
                rate: engine.sample_rate,
                supported: vec![TELEPHONY_SAMPLE_RATE],
            });
        }
        Ok(Self { telephony, engine })
    }

    pub fn telephony_format(&self) -> AudioFormat {
        self.telephony
    }

    pub fn engine_format(&self) -> AudioFormat {
        self.engine
    }

    /// Whether frames cross the relay without touching the payload
    pub fn is_passthrough(&self) -> bool {
        self.telephony == self.engine
    }

    /// Convert an inbound caller frame to the engine's input format
    pub fn telephony_to_engine(&self, payload: Bytes) -> Result<Bytes> {
        if self.is_passthrough() {
            return Ok(payload);
        }
        let samples = decode_g711(self.telephony.encoding, &payload);
        encode_for(self.engine, &samples, self.telephony.sample_rate)
    }

    /// Convert an agent audio chunk to the telephony format
    pub fn engine_to_telephony(&self, payload: Bytes) -> Result<Bytes> {
        if self.is_passthrough() {
            return Ok(payload);
        }
        let samples = match self.engine.encoding {
            AudioEncoding::Pcm16 => pcm16_le_to_samples(&payload)?,
            encoding => decode_g711(encoding, &payload),
        };
        encode_for(self.telephony, &samples, self.engine.sample_rate)
    }

    /// Decode a telephony payload to linear samples, for level analysis
    pub fn telephony_samples(&self, payload: &[u8]) -> Vec<i16> {
        decode_g711(self.telephony.encoding, payload)
    }
}

fn decode_g711(encoding: AudioEncoding, payload: &[u8]) -> Vec<i16> {
    match encoding {
        AudioEncoding::G711Alaw => tables::alaw_decode_slice(payload),
        _ => tables::ulaw_decode_slice(payload),
    }
}

fn encode_for(target: AudioFormat, samples: &[i16], source_rate: u32) -> Result<Bytes> {
    let resampled = resample_linear(samples, source_rate, target.sample_rate);
    Ok(Bytes::from(encode_samples(target.encoding, &resampled)))
}

fn encode_samples(encoding: AudioEncoding, samples: &[i16]) -> Vec<u8> {
    match encoding {
        AudioEncoding::G711Ulaw => g711::ulaw_encode_slice(samples),
        AudioEncoding::G711Alaw => g711::alaw_encode_slice(samples),
        AudioEncoding::Pcm16 => samples_to_pcm16_le(samples),
    }
}
