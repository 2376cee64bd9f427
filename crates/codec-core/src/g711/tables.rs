//! G.711 lookup tables
//!
//! Encode tables cover the full 16-bit input range (64 KiB each), decode
//! tables all 256 codes. Every relayed frame goes through them, so the
//! per-sample cost is a single index.

use super::{alaw_compress, alaw_expand, ulaw_compress, ulaw_expand};
use std::sync::LazyLock;

static ULAW_ENCODE: LazyLock<Box<[u8; 65536]>> = LazyLock::new(|| {
    let mut table = Box::new([0u8; 65536]);
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = ulaw_compress((i as u16).wrapping_sub(32768) as i16);
    }
    table
});

static ULAW_DECODE: LazyLock<[i16; 256]> = LazyLock::new(|| {
    let mut table = [0i16; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = ulaw_expand(i as u8);
    }
    table
});

static ALAW_ENCODE: LazyLock<Box<[u8; 65536]>> = LazyLock::new(|| {
    let mut table = Box::new([0u8; 65536]);
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = alaw_compress((i as u16).wrapping_sub(32768) as i16);
    }
    table
});

static ALAW_DECODE: LazyLock<[i16; 256]> = LazyLock::new(|| {
    let mut table = [0i16; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = alaw_expand(i as u8);
    }
    table
});

#[inline]
fn index(sample: i16) -> usize {
    (sample as u16).wrapping_add(32768) as usize
}

/// Table-driven μ-law compression
#[inline]
pub fn ulaw_encode(sample: i16) -> u8 {
    ULAW_ENCODE[index(sample)]
}

/// Table-driven μ-law expansion
#[inline]
pub fn ulaw_decode(byte: u8) -> i16 {
    ULAW_DECODE[byte as usize]
}

/// Table-driven A-law compression
#[inline]
pub fn alaw_encode(sample: i16) -> u8 {
    ALAW_ENCODE[index(sample)]
}

/// Table-driven A-law expansion
#[inline]
pub fn alaw_decode(byte: u8) -> i16 {
    ALAW_DECODE[byte as usize]
}

pub fn ulaw_encode_slice(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| ulaw_encode(s)).collect()
}

pub fn ulaw_decode_slice(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| ulaw_decode(b)).collect()
}

pub fn alaw_encode_slice(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| alaw_encode(s)).collect()
}

pub fn alaw_decode_slice(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| alaw_decode(b)).collect()
}
