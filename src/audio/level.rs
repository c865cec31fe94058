//! Signal level estimate used by the auto-pause path.
//!
//! The level is the RMS of the sample magnitudes expressed on the 16-bit
//! integer scale, so one threshold value applies to both encodings.

use super::chunk::{AudioChunk, SampleEncoding};
use crate::error::Result;

/// RMS of `chunk` on the 16-bit integer scale.
///
/// Empty chunks have level 0. A length that is not a multiple of the sample
/// width is rejected with `MalformedAudio` rather than truncated.
pub fn estimate_level(chunk: &AudioChunk) -> Result<f64> {
    let count = chunk.sample_count()?;
    if count == 0 {
        return Ok(0.0);
    }

    let encoding = chunk.encoding();
    let data = chunk.data();
    let sum_sq: f64 = match encoding {
        SampleEncoding::Int16 => data
            .chunks_exact(2)
            .map(|b| {
                let s = i16::from_le_bytes([b[0], b[1]]) as f64;
                s * s
            })
            .sum(),
        SampleEncoding::Float32 => data
            .chunks_exact(4)
            .map(|b| {
                let s = f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64;
                s * s
            })
            .sum(),
    };

    Ok((sum_sq / count as f64).sqrt() * encoding.pcm16_scale())
}
