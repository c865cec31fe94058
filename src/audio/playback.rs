//! The playback loop that releases queued chunks to the audio sink.
//!
//! Runs on a dedicated std::thread, not a tokio task. Every wait in the loop
//! is a bounded blocking sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::chunk::AudioChunk;
use super::resample;
use super::sink::AudioSink;
use crate::error::Result;
use crate::pause_gate::PauseGate;

/// Longest the loop blocks on an empty queue before re-checking shutdown.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
/// Sleep step while waiting for a pause to clear.
pub const PAUSE_POLL_STEP: Duration = Duration::from_millis(50);
/// Inbound audio is re-cut into chunks of this length before queueing.
pub const CHUNK_LENGTH: Duration = Duration::from_millis(100);
/// Partial data older than this is flushed as a short chunk.
const RESIDUE_STALE_AFTER: Duration = Duration::from_millis(150);

/// Playback loop settings.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Rate the sink expects; chunks are converted before emission.
    pub output_sample_rate: u32,
    /// Fraction of each chunk's duration to sleep after emitting it.
    pub chunk_pacing: f64,
}

/// Producer side of the playback queue. Cheap to clone.
///
/// The queue is unbounded: a long pause accumulates audio instead of
/// dropping it.
#[derive(Clone)]
pub struct PlaybackQueue {
    tx: Sender<AudioChunk>,
    rechunker: Arc<Mutex<Rechunker>>,
}

impl PlaybackQueue {
    fn new(tx: Sender<AudioChunk>) -> Self {
        Self {
            tx,
            rechunker: Arc::new(Mutex::new(Rechunker::default())),
        }
    }

    /// Adds inbound 16-bit PCM of any length, cut into `CHUNK_LENGTH` pieces.
    pub fn add_chunk(&self, pcm: &[u8], sample_rate: u32) {
        let mut rechunker = self.rechunker.lock();
        for chunk in rechunker.push(pcm, sample_rate, Instant::now()) {
            self.send(chunk);
        }
    }

    /// Queues a chunk as-is, after any partial data still being collected.
    pub fn enqueue(&self, chunk: AudioChunk) {
        let mut rechunker = self.rechunker.lock();
        if let Some(residue) = rechunker.take_residue() {
            self.send(residue);
        }
        self.send(chunk);
    }

    /// Number of chunks waiting to be played.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    fn flush_stale(&self) {
        let mut rechunker = self.rechunker.lock();
        if let Some(residue) = rechunker.take_stale(Instant::now()) {
            self.send(residue);
        }
    }

    fn discard_residue(&self) {
        self.rechunker.lock().pending.clear();
    }

    fn send(&self, chunk: AudioChunk) {
        if self.tx.send(chunk).is_err() {
            log::warn!("Playback queue closed, dropping chunk");
        }
    }
}

/// Collects inbound bytes and cuts them into fixed-length chunks.
#[derive(Default)]
struct Rechunker {
    pending: BytesMut,
    sample_rate: u32,
    last_push: Option<Instant>,
}

impl Rechunker {
    fn push(&mut self, pcm: &[u8], sample_rate: u32, now: Instant) -> Vec<AudioChunk> {
        let mut out = Vec::new();

        let stale = self
            .last_push
            .is_some_and(|t| now.duration_since(t) > RESIDUE_STALE_AFTER);
        if stale || sample_rate != self.sample_rate {
            out.extend(self.take_residue());
        }
        self.sample_rate = sample_rate;
        self.last_push = Some(now);

        self.pending.extend_from_slice(pcm);
        let size = chunk_size_bytes(sample_rate);
        while self.pending.len() >= size {
            let data = self.pending.split_to(size).freeze();
            out.push(AudioChunk::pcm16(data, sample_rate));
        }
        out
    }

    fn take_residue(&mut self) -> Option<AudioChunk> {
        // Whole samples only; a dangling odd byte is dropped.
        let whole = self.pending.len() & !1;
        let data = self.pending.split_to(whole).freeze();
        self.pending.clear();
        (!data.is_empty()).then(|| AudioChunk::pcm16(data, self.sample_rate))
    }

    fn take_stale(&mut self, now: Instant) -> Option<AudioChunk> {
        match self.last_push {
            Some(t) if now.duration_since(t) > RESIDUE_STALE_AFTER && !self.pending.is_empty() => {
                self.take_residue()
            }
            _ => None,
        }
    }
}

fn chunk_size_bytes(sample_rate: u32) -> usize {
    let samples = sample_rate as u128 * CHUNK_LENGTH.as_millis() / 1000;
    (samples as usize * 2).max(2)
}

/// Owns the playback thread.
pub struct PlaybackLoop {
    running: Arc<AtomicBool>,
    queue: PlaybackQueue,
    backlog: Receiver<AudioChunk>,
    gate: Arc<PauseGate>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackLoop {
    /// Spawn the playback thread.
    ///
    /// * `config` - Output rate and pacing
    /// * `gate`   - Pause state consulted before every emission
    /// * `sink`   - Downstream target for released chunks
    pub fn start<S: AudioSink>(
        config: PlaybackConfig,
        gate: Arc<PauseGate>,
        sink: S,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = PlaybackQueue::new(tx);
        let running = Arc::new(AtomicBool::new(true));

        log::info!(
            "Playback starting: output_rate={}Hz, pacing={}",
            config.output_sample_rate,
            config.chunk_pacing,
        );

        let handle = {
            let running = running.clone();
            let gate = gate.clone();
            let queue = queue.clone();
            let rx = rx.clone();
            thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || playback_thread(&config, rx, &queue, &gate, sink, &running))?
        };

        Ok(Self {
            running,
            queue,
            backlog: rx,
            gate,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> PlaybackQueue {
        self.queue.clone()
    }

    /// Stop the thread, discard queued audio and clear the pause window.
    ///
    /// Returns within one dequeue timeout or pause poll step.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.join().is_err() {
            log::error!("Playback thread panicked");
        }

        self.queue.discard_residue();
        let discarded = self.backlog.try_iter().count();
        if discarded > 0 {
            log::info!("Discarded {} queued chunks on shutdown", discarded);
        }
        self.gate.clear();
    }
}

impl Drop for PlaybackLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn playback_thread<S: AudioSink>(
    config: &PlaybackConfig,
    rx: Receiver<AudioChunk>,
    queue: &PlaybackQueue,
    gate: &PauseGate,
    mut sink: S,
    running: &AtomicBool,
) {
    while running.load(Ordering::Relaxed) {
        let chunk = match rx.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => {
                queue.flush_stale();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::info!("Playback channel closed");
                break;
            }
        };

        // The chunk is held here, not requeued, so order is preserved.
        if !wait_while_paused(gate, running) {
            break;
        }

        let chunk = match resample::to_output_rate(chunk, config.output_sample_rate) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Skipping chunk that cannot be converted: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.emit(&chunk) {
            log::error!("Audio sink error: {}", e);
            continue;
        }

        if config.chunk_pacing > 0.0 && config.chunk_pacing.is_finite() {
            pace(chunk.duration().mul_f64(config.chunk_pacing), gate, running);
        }
    }

    log::info!("Playback stopped");
}

/// Sleeps until the pause clears. Returns false if shutdown began first.
fn wait_while_paused(gate: &PauseGate, running: &AtomicBool) -> bool {
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = gate.remaining();
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(PAUSE_POLL_STEP));
    }
}

/// Inter-chunk sleep; cut short by a new pause or by shutdown.
fn pace(total: Duration, gate: &PauseGate, running: &AtomicBool) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) && !gate.is_active() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(PAUSE_POLL_STEP));
    }
}

/// Queue without a consumer thread, for exercising producers.
#[cfg(test)]
pub(crate) fn detached_queue() -> (PlaybackQueue, Receiver<AudioChunk>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (PlaybackQueue::new(tx), rx)
}
