//! Typed audio buffers passed between the bridge, the level estimator and the
//! playback loop.

use bytes::Bytes;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Sample encodings accepted from the wire and from the meeting audio pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// 16-bit signed little-endian integer PCM.
    Int16,
    /// 32-bit little-endian float, nominal range [-1.0, 1.0].
    Float32,
}

impl SampleEncoding {
    /// Bytes per sample.
    pub const fn sample_width(self) -> usize {
        match self {
            SampleEncoding::Int16 => 2,
            SampleEncoding::Float32 => 4,
        }
    }

    /// Factor that maps one sample of this encoding onto the 16-bit integer
    /// amplitude scale.
    pub const fn pcm16_scale(self) -> f64 {
        match self {
            SampleEncoding::Int16 => 1.0,
            SampleEncoding::Float32 => 32767.0,
        }
    }

    /// Tag byte used by the local UDP framing (`0` = Int16, `1` = Float32).
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SampleEncoding::Int16),
            1 => Some(SampleEncoding::Float32),
            _ => None,
        }
    }
}

/// An immutable block of mono samples at a known rate and encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    data: Bytes,
    sample_rate: u32,
    encoding: SampleEncoding,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>, sample_rate: u32, encoding: SampleEncoding) -> Self {
        Self {
            data: data.into(),
            sample_rate,
            encoding,
        }
    }

    /// Shorthand for a 16-bit PCM chunk.
    pub fn pcm16(data: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self::new(data, sample_rate, SampleEncoding::Int16)
    }

    /// Builds a 16-bit PCM chunk from samples.
    pub fn from_i16_samples(samples: &[i16], sample_rate: u32) -> Self {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::pcm16(data, sample_rate)
    }

    /// Builds a float chunk from samples.
    pub fn from_f32_samples(samples: &[f32], sample_rate: u32) -> Self {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(data, sample_rate, SampleEncoding::Float32)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of samples, or `MalformedAudio` when the byte length does not
    /// divide evenly by the sample width.
    pub fn sample_count(&self) -> Result<usize> {
        let width = self.encoding.sample_width();
        if self.data.len() % width != 0 {
            return Err(RelayError::MalformedAudio {
                len: self.data.len(),
                width,
            });
        }
        Ok(self.data.len() / width)
    }

    /// Playback duration; zero for malformed chunks or a zero rate.
    pub fn duration(&self) -> Duration {
        match self.sample_count() {
            Ok(n) if self.sample_rate > 0 => {
                Duration::from_secs_f64(n as f64 / self.sample_rate as f64)
            }
            _ => Duration::ZERO,
        }
    }

    /// Decodes the samples as 16-bit integers. Float samples are clamped to
    /// [-1.0, 1.0] and scaled.
    pub fn pcm16_samples(&self) -> Result<Vec<i16>> {
        self.sample_count()?;
        let samples = match self.encoding {
            SampleEncoding::Int16 => self
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
            SampleEncoding::Float32 => self
                .data
                .chunks_exact(4)
                .map(|b| {
                    let s = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
                    (s as f64 * SampleEncoding::Float32.pcm16_scale()).round() as i16
                })
                .collect(),
        };
        Ok(samples)
    }

    /// Re-encodes the chunk as 16-bit PCM. Int16 chunks are returned as-is.
    pub fn to_pcm16(&self) -> Result<AudioChunk> {
        match self.encoding {
            SampleEncoding::Int16 => {
                self.sample_count()?;
                Ok(self.clone())
            }
            SampleEncoding::Float32 => Ok(Self::from_i16_samples(
                &self.pcm16_samples()?,
                self.sample_rate,
            )),
        }
    }
}
