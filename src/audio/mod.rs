//! audio - Chunks, level metering and the playback loop
//!
//! Capture, mixing and the platform's own audio pipeline live outside this
//! crate; this module only decides whether and when queued audio flows.

mod chunk;
mod level;
mod playback;
mod resample;
mod sink;

pub use chunk::{AudioChunk, SampleEncoding};
pub use level::estimate_level;
pub use playback::{
    PlaybackConfig, PlaybackLoop, PlaybackQueue, CHUNK_LENGTH, DEQUEUE_TIMEOUT, PAUSE_POLL_STEP,
};
pub use resample::to_output_rate;
pub use sink::AudioSink;

#[cfg(test)]
pub(crate) use playback::detached_queue;
