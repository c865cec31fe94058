//! Conversion of queued chunks to the sink's output sample rate.
//!
//! Integer up-sampling ratios repeat each sample. Every other ratio goes
//! through a `rubato` polynomial resampler created for the chunk.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use super::chunk::{AudioChunk, SampleEncoding};
use crate::error::{RelayError, Result};

/// Returns `chunk` as 16-bit PCM at `output_rate`.
pub fn to_output_rate(chunk: AudioChunk, output_rate: u32) -> Result<AudioChunk> {
    let input_rate = chunk.sample_rate();
    if input_rate == 0 || output_rate == 0 {
        return Err(RelayError::Resample(format!(
            "cannot convert {input_rate} Hz to {output_rate} Hz"
        )));
    }

    if input_rate == output_rate {
        return match chunk.encoding() {
            SampleEncoding::Int16 => {
                chunk.sample_count()?;
                Ok(chunk)
            }
            SampleEncoding::Float32 => chunk.to_pcm16(),
        };
    }

    let samples = chunk.pcm16_samples()?;
    if samples.is_empty() {
        return Ok(AudioChunk::pcm16(Vec::<u8>::new(), output_rate));
    }

    let converted = if output_rate % input_rate == 0 {
        repeat_samples(&samples, (output_rate / input_rate) as usize)
    } else {
        interpolate(&samples, input_rate, output_rate)?
    };

    Ok(AudioChunk::from_i16_samples(&converted, output_rate))
}

fn repeat_samples(samples: &[i16], ratio: usize) -> Vec<i16> {
    samples
        .iter()
        .flat_map(|&s| std::iter::repeat_n(s, ratio))
        .collect()
}

fn interpolate(samples: &[i16], input_rate: u32, output_rate: u32) -> Result<Vec<i16>> {
    let ratio = output_rate as f64 / input_rate as f64;
    let input: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();

    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0,
        PolynomialDegree::Linear,
        input.len(),
        1,
    )
    .map_err(|e| RelayError::Resample(format!("resampler init: {e}")))?;

    let output = resampler
        .process(&[input], None)
        .map_err(|e| RelayError::Resample(e.to_string()))?;

    Ok(output
        .into_iter()
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect())
}
