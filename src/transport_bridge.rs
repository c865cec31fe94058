//! Glue between the remote agent connection, the playback queue and the
//! pause gate.
//!
//! Inbound: bot audio is queued for playback, pause commands go to the gate,
//! anything else is logged and dropped.
//! Outbound: every mixed meeting frame is forwarded as telemetry, and a frame
//! at or above the configured threshold also pauses playback and tells the
//! peer, using the same message shape as the inbound pause command.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

use crate::audio::{estimate_level, AudioChunk, PlaybackQueue};
use crate::config::ThresholdConfig;
use crate::error::{RelayError, Result};
use crate::net_link::Connection;
use crate::pause_gate::PauseGate;
use crate::protocol::{self, InboundMessage};
use crate::reconnect::{shutdown_requested, ConnectionState, SessionDriver, SessionEnd};

const OUTBOUND_CAPACITY: usize = 256;

struct BridgeShared {
    bot_id: String,
    sample_rate: u32,
    gate: Arc<PauseGate>,
    queue: PlaybackQueue,
    threshold: Option<ThresholdConfig>,
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<ConnectionState>,
}

#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<BridgeShared>,
}

/// Session driver owning the outbound half of the bridge.
pub struct TransportBridge {
    shared: Arc<BridgeShared>,
    outbound_rx: mpsc::Receiver<String>,
}

impl TransportBridge {
    /// * `bot_id`      - Stamped on every outbound message
    /// * `sample_rate` - Rate of the mixed meeting audio
    /// * `threshold`   - Auto-pause setting, `None` disables it
    /// * `state`       - Connection state published by the supervisor
    pub fn new(
        bot_id: String,
        sample_rate: u32,
        gate: Arc<PauseGate>,
        queue: PlaybackQueue,
        threshold: Option<ThresholdConfig>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            shared: Arc::new(BridgeShared {
                bot_id,
                sample_rate,
                gate,
                queue,
                threshold,
                outbound,
                state,
            }),
            outbound_rx,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: self.shared.clone(),
        }
    }
}

#[async_trait]
impl SessionDriver for TransportBridge {
    // 上一个连接遗留的消息已过期，不重放
    fn before_connected(&mut self) {
        let mut stale = 0;
        while self.outbound_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            log::debug!("Discarded {} outbound messages from the previous connection", stale);
        }
    }

    async fn drive(
        &mut self,
        conn: &mut dyn Connection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        // 主循环，处理读取和写入
        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                inbound = conn.receive() => match inbound {
                    Ok(Some(text)) => self.shared.handle_inbound_text(&text),
                    Ok(None) => {
                        return SessionEnd::Lost(RelayError::Connection(
                            "connection closed by peer".into(),
                        ));
                    }
                    Err(e) => return SessionEnd::Lost(e),
                },
                Some(text) = self.outbound_rx.recv() => {
                    if let Err(e) = conn.send(text).await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }
}

impl BridgeHandle {
    /// Called by the audio pipeline for every mixed meeting frame.
    ///
    /// Never blocks: outbound messages that cannot be queued are dropped.
    pub fn on_mixed_frame(&self, frame: &AudioChunk) {
        self.shared.maybe_auto_pause(frame);
        self.shared.forward_mixed_audio(frame);
    }

    pub fn handle_inbound_text(&self, text: &str) {
        self.shared.handle_inbound_text(text);
    }

    /// Runs the level check alone; returns whether playback was paused.
    pub fn maybe_auto_pause(&self, frame: &AudioChunk) -> bool {
        self.shared.maybe_auto_pause(frame)
    }
}

impl BridgeShared {
    fn handle_inbound_text(&self, text: &str) {
        match protocol::parse_inbound(text) {
            Ok(InboundMessage::BotOutput { pcm, sample_rate }) => {
                self.queue.add_chunk(&pcm, sample_rate);
            }
            Ok(InboundMessage::PauseCurrentLecture { duration }) => {
                log::info!("Pause requested by peer for {:?}", duration);
                self.gate.pause_for(duration);
            }
            // 无法识别的消息只记录日志，不断开连接
            Err(e) => log::warn!("Ignoring inbound message: {}", e),
        }
    }

    fn maybe_auto_pause(&self, frame: &AudioChunk) -> bool {
        let Some(threshold) = self.threshold else {
            return false;
        };
        let level = match estimate_level(frame) {
            Ok(level) => level,
            Err(e) => {
                log::warn!("Skipping frame for metering: {}", e);
                return false;
            }
        };
        if level < threshold.threshold as f64 {
            return false;
        }

        log::debug!(
            "Mixed audio level {:.0} >= {}, pausing playback for {:?}",
            level,
            threshold.threshold,
            threshold.auto_pause_duration
        );
        self.gate.pause_for(threshold.auto_pause_duration);
        self.offer(|| protocol::pause_message(&self.bot_id, threshold.auto_pause_duration));
        true
    }

    fn forward_mixed_audio(&self, frame: &AudioChunk) {
        self.offer(|| {
            let pcm = frame.to_pcm16()?;
            let rate = if frame.sample_rate() > 0 {
                frame.sample_rate()
            } else {
                self.sample_rate
            };
            protocol::mixed_audio_message(&self.bot_id, pcm.data(), rate, unix_millis())
        });
    }

    /// Queues an outbound message if connected; otherwise drops it.
    fn offer(&self, build: impl FnOnce() -> Result<String>) {
        if *self.state.borrow() != ConnectionState::Connected {
            log::debug!("Not connected, dropping outbound message");
            return;
        }
        let text = match build() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Dropping outbound message: {}", e);
                return;
            }
        };
        if let Err(e) = self.outbound.try_send(text) {
            log::warn!("Outbound queue unavailable, dropping message: {}", e);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::detached_queue;
    use crossbeam_channel::Receiver;
    use serde_json::Value;
    use std::time::Duration;

    struct Fixture {
        bridge: TransportBridge,
        handle: BridgeHandle,
        gate: Arc<PauseGate>,
        played: Receiver<AudioChunk>,
        state: watch::Sender<ConnectionState>,
    }

    fn fixture(threshold: Option<u32>) -> Fixture {
        let gate = Arc::new(PauseGate::new());
        let (queue, played) = detached_queue();
        let (state, state_rx) = watch::channel(ConnectionState::Connected);
        let bridge = TransportBridge::new(
            "bot_auto_pause".into(),
            16000,
            gate.clone(),
            queue,
            threshold.map(ThresholdConfig::new),
            state_rx,
        );
        let handle = bridge.handle();
        Fixture {
            bridge,
            handle,
            gate,
            played,
            state,
        }
    }

    fn drain(bridge: &mut TransportBridge) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = bridge.outbound_rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn constant_frame(value: i16) -> AudioChunk {
        AudioChunk::from_i16_samples(&[value; 100], 16000)
    }

    #[test]
    fn loud_frame_pauses_and_notifies_peer() {
        let mut f = fixture(Some(1000));
        f.handle.on_mixed_frame(&constant_frame(1200));

        assert!(f.gate.is_active());
        assert!(f.gate.remaining() <= Duration::from_millis(800));

        let sent = drain(&mut f.bridge);
        let pause = sent
            .iter()
            .find(|m| m["trigger"] == "realtime_audio.pause_current_lecture")
            .expect("pause notice");
        assert_eq!(pause["data"]["duration"], 800);
        assert_eq!(pause["bot_id"], "bot_auto_pause");
        assert!(sent.iter().any(|m| m["trigger"] == "realtime_audio.mixed"));
    }

    #[test]
    fn quiet_frame_is_forwarded_without_pausing() {
        let mut f = fixture(Some(1500));
        f.handle.on_mixed_frame(&constant_frame(800));

        assert!(!f.gate.is_active());
        let sent = drain(&mut f.bridge);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["trigger"], "realtime_audio.mixed");
        assert_eq!(sent[0]["data"]["sample_rate"], 16000);
    }

    #[test]
    fn no_threshold_disables_auto_pause() {
        let f = fixture(None);
        assert!(!f.handle.maybe_auto_pause(&constant_frame(i16::MAX)));
        assert!(!f.gate.is_active());
    }

    #[test]
    fn float_frames_use_the_same_threshold() {
        let f = fixture(Some(1000));
        let loud = AudioChunk::from_f32_samples(&[1200.0 / 32767.0; 100], 16000);
        assert!(f.handle.maybe_auto_pause(&loud));

        let f = fixture(Some(1000));
        let quiet = AudioChunk::from_f32_samples(&[800.0 / 32767.0; 100], 16000);
        assert!(!f.handle.maybe_auto_pause(&quiet));
    }

    #[test]
    fn malformed_frame_is_skipped_for_metering() {
        let f = fixture(Some(0));
        let frame = AudioChunk::pcm16(vec![0u8; 7], 16000);
        assert!(!f.handle.maybe_auto_pause(&frame));
        assert!(!f.gate.is_active());
    }

    #[test]
    fn nothing_is_queued_while_disconnected() {
        let mut f = fixture(Some(1000));
        f.state.send(ConnectionState::Connecting).unwrap();
        f.handle.on_mixed_frame(&constant_frame(1200));

        // Playback still pauses; only telemetry is dropped.
        assert!(f.gate.is_active());
        assert!(drain(&mut f.bridge).is_empty());
    }

    #[test]
    fn inbound_pause_command_pauses_playback() {
        let f = fixture(None);
        f.handle.handle_inbound_text(
            r#"{"trigger":"realtime_audio.pause_current_lecture","data":{"duration":1500}}"#,
        );
        assert!(f.gate.is_active());
        assert!(f.gate.remaining() > Duration::from_millis(1000));
    }

    /// Records sends; the peer hangs up after `lifetime`.
    struct RecordingConnection {
        sent: Arc<parking_lot::Mutex<Vec<String>>>,
        lifetime: Duration,
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn send(&mut self, text: String) -> Result<()> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Option<String>> {
            tokio::time::sleep(self.lifetime).await;
            Ok(None)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn messages_from_a_lost_connection_are_not_replayed() {
        let mut f = fixture(Some(1000));
        let (_shutdown_tx, mut shutdown) = watch::channel(false);
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));

        // Left in the channel when the previous connection was lost.
        f.handle.on_mixed_frame(&constant_frame(1200));
        f.handle.on_mixed_frame(&constant_frame(100));

        let mut conn = RecordingConnection {
            sent: sent.clone(),
            lifetime: Duration::from_millis(50),
        };
        f.bridge.before_connected();
        let end = f.bridge.drive(&mut conn, &mut shutdown).await;
        assert!(matches!(end, SessionEnd::Lost(_)));
        assert!(sent.lock().is_empty());

        // Traffic produced during the new connection still goes out.
        let mut conn = RecordingConnection {
            sent: sent.clone(),
            lifetime: Duration::from_millis(50),
        };
        f.bridge.before_connected();
        let handle = f.handle.clone();
        let later_frame = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.on_mixed_frame(&constant_frame(100));
        };
        let (end, ()) = tokio::join!(f.bridge.drive(&mut conn, &mut shutdown), later_frame);
        assert!(matches!(end, SessionEnd::Lost(_)));
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("realtime_audio.mixed"));
    }

    #[test]
    fn huge_inbound_pause_is_dropped_and_session_continues() {
        let f = fixture(None);
        f.handle.handle_inbound_text(
            r#"{"trigger":"realtime_audio.pause_current_lecture","data":{"duration":10000000000000000000000}}"#,
        );
        assert!(!f.gate.is_active());

        f.handle.handle_inbound_text(
            r#"{"trigger":"realtime_audio.pause_current_lecture","data":{"duration":500}}"#,
        );
        assert!(f.gate.is_active());
    }

    #[test]
    fn odd_length_audio_does_not_shift_later_samples() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let f = fixture(None);
        let message = |pcm: Vec<u8>| {
            serde_json::json!({
                "trigger": "realtime_audio.bot_output",
                "data": { "chunk": STANDARD.encode(pcm), "sample_rate": 16000 }
            })
            .to_string()
        };
        f.handle.handle_inbound_text(&message(vec![0u8; 3201]));
        let samples: Vec<u8> = [256i16; 1600].iter().flat_map(|s| s.to_le_bytes()).collect();
        f.handle.handle_inbound_text(&message(samples));

        let queued: Vec<AudioChunk> = f.played.try_iter().collect();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].pcm16_samples().unwrap().iter().all(|&s| s == 256));
    }

    #[test]
    fn inbound_audio_is_queued_in_chunks() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let f = fixture(None);
        // 200 ms at 16 kHz.
        let text = serde_json::json!({
            "trigger": "realtime_audio.bot_output",
            "data": { "chunk": STANDARD.encode(vec![0u8; 6400]), "sample_rate": 16000 }
        })
        .to_string();
        f.handle.handle_inbound_text(&text);

        let queued: Vec<AudioChunk> = f.played.try_iter().collect();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|c| c.data().len() == 3200));
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let f = fixture(None);
        f.handle.handle_inbound_text(r#"{"trigger":"realtime_audio.unknown","data":{}}"#);
        f.handle.handle_inbound_text("garbage");
        assert!(!f.gate.is_active());
        assert_eq!(f.played.try_iter().count(), 0);
    }
}
