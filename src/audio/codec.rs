//! Conversion between normalized f32 samples and 16-bit little-endian PCM frames.
//!
//! - Encode: clamp to [-1, 1] → scale by 32767 → truncate toward zero
//! - Decode: i16 / 32767 → clamp to [-1, 1]

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

use crate::error::{AudioError, Result};

/// Full-scale value used in both directions.
pub const PCM_SCALE: f32 = 32767.0;

/// Bytes per mono 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// A block of normalized mono samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl SampleBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A block of `len` zero samples.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Always 1: the pipeline is mono end to end.
    pub fn channels(&self) -> u16 {
        1
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// An immutable, sample-aligned PCM payload (LE i16, mono).
///
/// Construction rejects odd lengths, so every `PcmFrame` holds a whole
/// number of samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame(Bytes);

impl PcmFrame {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(AudioError::Alignment { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// Only for callers that already guarantee even length.
    pub(crate) fn from_aligned(bytes: Bytes) -> Self {
        debug_assert!(bytes.len() % BYTES_PER_SAMPLE == 0);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.0.len() / BYTES_PER_SAMPLE
    }
}

/// Convert one normalized sample to i16 (clamp, scale, truncate).
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    // NaN survives clamp and casts to 0
    (f64::from(sample.clamp(-1.0, 1.0)) * f64::from(PCM_SCALE)) as i16
}

/// Convert one i16 sample back to a normalized float.
#[inline]
pub fn i16_to_sample(value: i16) -> f32 {
    (f32::from(value) / PCM_SCALE).max(-1.0)
}

pub fn encode(block: &SampleBlock) -> PcmFrame {
    let mut buf = BytesMut::with_capacity(block.len() * BYTES_PER_SAMPLE);
    for &s in block.samples() {
        buf.put_i16_le(sample_to_i16(s));
    }
    PcmFrame::from_aligned(buf.freeze())
}

pub fn decode(frame: &PcmFrame, sample_rate: u32) -> SampleBlock {
    let samples = frame
        .as_bytes()
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();
    SampleBlock::new(samples, sample_rate)
}

/// Decode an unvalidated byte payload. Odd lengths fail with `Alignment`.
pub fn decode_bytes(bytes: &[u8], sample_rate: u32) -> Result<SampleBlock> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(AudioError::Alignment { len: bytes.len() });
    }
    Ok(decode(
        &PcmFrame::from_aligned(Bytes::copy_from_slice(bytes)),
        sample_rate,
    ))
}
