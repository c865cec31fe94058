//! Downstream playback target.

use super::chunk::AudioChunk;
use crate::error::Result;

/// Receives chunks released by the playback loop.
///
/// Called from the playback thread, one chunk at a time, in queue order. An
/// error affects only the chunk being emitted.
pub trait AudioSink: Send + 'static {
    fn emit(&mut self, chunk: &AudioChunk) -> Result<()>;
}

impl<F> AudioSink for F
where
    F: FnMut(&AudioChunk) -> Result<()> + Send + 'static,
{
    fn emit(&mut self, chunk: &AudioChunk) -> Result<()> {
        self(chunk)
    }
}
