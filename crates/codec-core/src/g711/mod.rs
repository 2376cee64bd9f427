//! G.711 companding (ITU-T G.711, μ-law and A-law)
//!
//! The per-sample functions follow the ITU-T STL reference algorithm and
//! are bit-exact with it. Bulk conversion goes through the lookup tables in
//! [`tables`], which are built from these same functions on first use.

pub mod tables;

pub use tables::{alaw_decode_slice, alaw_encode_slice, ulaw_decode_slice, ulaw_encode_slice};

/// μ-law byte for digital silence
pub const ULAW_SILENCE: u8 = 0xFF;

/// A-law byte for digital silence
pub const ALAW_SILENCE: u8 = 0xD5;

/// Compress one 16-bit linear sample to μ-law
///
/// Uses the 14 most significant bits of the input with a bias of 33.
pub fn ulaw_compress(sample: i16) -> u8 {
    let magnitude = if sample < 0 {
        (((!sample) as u16) >> 2) as i16 + 33
    } else {
        (sample >> 2) + 33
    };
    let magnitude = magnitude.min(0x1FFF);

    let mut segment = 1;
    let mut rest = magnitude >> 6;
    while rest != 0 {
        segment += 1;
        rest >>= 1;
    }

    let high_nibble = 0x0008 - segment;
    let low_nibble = 0x000F - ((magnitude >> segment) & 0x000F);
    let mut byte = (high_nibble << 4) | low_nibble;
    if sample >= 0 {
        byte |= 0x0080;
    }
    byte as u8
}

/// Expand one μ-law byte to a 16-bit linear sample
pub fn ulaw_expand(byte: u8) -> i16 {
    let sign = if byte < 0x80 { -1 } else { 1 };
    let inverted = (!byte) as i16;
    let exponent = (inverted >> 4) & 0x0007;
    let mantissa = inverted & 0x000F;
    let step = 4 << (exponent + 1);

    sign * ((0x0080 << exponent) + step * mantissa + step / 2 - 4 * 33)
}

/// Compress one 16-bit linear sample to A-law
///
/// Uses the 13 most significant bits; even bits are toggled on output.
pub fn alaw_compress(sample: i16) -> u8 {
    let mut value = if sample < 0 {
        (((!sample) as u16) >> 4) as i16
    } else {
        sample >> 4
    };

    if value > 15 {
        let mut exponent = 1;
        while value > 16 + 15 {
            value >>= 1;
            exponent += 1;
        }
        value -= 16;
        value += exponent << 4;
    }
    if sample >= 0 {
        value |= 0x0080;
    }
    (value ^ 0x0055) as u8
}

/// Expand one A-law byte to a 16-bit linear sample
pub fn alaw_expand(byte: u8) -> i16 {
    let toggled = ((byte ^ 0x55) as i16) & 0x007F;
    let exponent = toggled >> 4;
    let mut mantissa = toggled & 0x000F;
    if exponent > 0 {
        mantissa += 16;
    }
    mantissa = (mantissa << 4) + 0x0008;
    if exponent > 1 {
        mantissa <<= exponent - 1;
    }
    if byte > 127 { mantissa } else { -mantissa }
}

/// Re-encode μ-law bytes as A-law without a caller-visible PCM buffer
pub fn ulaw_to_alaw(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .map(|&b| tables::alaw_encode(tables::ulaw_decode(b)))
        .collect()
}

/// Re-encode A-law bytes as μ-law
pub fn alaw_to_ulaw(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .map(|&b| tables::ulaw_encode(tables::alaw_decode(b)))
        .collect()
}
