//! JSON wire messages exchanged with the remote audio agent.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{RelayError, Result};

pub const TRIGGER_MIXED_AUDIO: &str = "realtime_audio.mixed";
pub const TRIGGER_BOT_OUTPUT: &str = "realtime_audio.bot_output";
pub const TRIGGER_PAUSE: &str = "realtime_audio.pause_current_lecture";

/// Sample rates the peer may use for bot output.
pub const SUPPORTED_SAMPLE_RATES: [u32; 3] = [8000, 16000, 24000];

/// Longest pause the peer may request.
pub const MAX_PAUSE_DURATION: Duration = Duration::from_secs(60 * 60);

/// A recognised inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// 16-bit PCM the bot should play into the meeting.
    BotOutput { pcm: Bytes, sample_rate: u32 },
    /// Hold the bot's playback for `duration`.
    PauseCurrentLecture { duration: Duration },
}

#[derive(Deserialize)]
struct Envelope {
    trigger: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct BotOutputData {
    chunk: String,
    sample_rate: u32,
}

#[derive(Deserialize)]
struct PauseData {
    duration: f64,
}

/// Parses one inbound text frame.
///
/// Unknown triggers and malformed payloads are `RelayError::Protocol`; the
/// caller logs and drops them.
pub fn parse_inbound(text: &str) -> Result<InboundMessage> {
    let envelope: Envelope = serde_json::from_str(text)?;

    match envelope.trigger.as_str() {
        TRIGGER_BOT_OUTPUT => {
            let data: BotOutputData = serde_json::from_value(envelope.data)?;
            if !SUPPORTED_SAMPLE_RATES.contains(&data.sample_rate) {
                return Err(RelayError::Protocol(format!(
                    "unsupported sample rate {}",
                    data.sample_rate
                )));
            }
            let pcm = STANDARD
                .decode(data.chunk.as_bytes())
                .map_err(|e| RelayError::Protocol(format!("invalid base64 chunk: {e}")))?;
            // 16-bit PCM: an odd byte would shift every later sample.
            if pcm.len() % 2 != 0 {
                return Err(RelayError::Protocol(format!(
                    "bot output of {} bytes is not whole 16-bit samples",
                    pcm.len()
                )));
            }
            Ok(InboundMessage::BotOutput {
                pcm: Bytes::from(pcm),
                sample_rate: data.sample_rate,
            })
        }
        TRIGGER_PAUSE => {
            let data: PauseData = serde_json::from_value(envelope.data)?;
            // Durations are milliseconds; non-positive values mean no pause.
            if data.duration > MAX_PAUSE_DURATION.as_millis() as f64 {
                return Err(RelayError::Protocol(format!(
                    "pause of {} ms exceeds {:?}",
                    data.duration, MAX_PAUSE_DURATION
                )));
            }
            let duration = if data.duration.is_finite() && data.duration > 0.0 {
                Duration::from_secs_f64(data.duration / 1000.0)
            } else {
                Duration::ZERO
            };
            Ok(InboundMessage::PauseCurrentLecture { duration })
        }
        other => Err(RelayError::Protocol(format!("unknown trigger: {other}"))),
    }
}

#[derive(Serialize)]
struct Outbound<'a, T> {
    bot_id: &'a str,
    trigger: &'static str,
    data: T,
}

#[derive(Serialize)]
struct MixedAudioData {
    chunk: String,
    sample_rate: u32,
    timestamp_ms: u64,
}

#[derive(Serialize)]
struct PauseNotice {
    duration: u64,
}

/// Outbound meeting-audio telemetry frame.
pub fn mixed_audio_message(
    bot_id: &str,
    pcm: &[u8],
    sample_rate: u32,
    timestamp_ms: u64,
) -> Result<String> {
    let msg = Outbound {
        bot_id,
        trigger: TRIGGER_MIXED_AUDIO,
        data: MixedAudioData {
            chunk: STANDARD.encode(pcm),
            sample_rate,
            timestamp_ms,
        },
    };
    Ok(serde_json::to_string(&msg)?)
}

/// Outbound notice that the bot paused itself, same shape as the inbound
/// command.
pub fn pause_message(bot_id: &str, duration: Duration) -> Result<String> {
    let msg = Outbound {
        bot_id,
        trigger: TRIGGER_PAUSE,
        data: PauseNotice {
            duration: duration.as_millis() as u64,
        },
    };
    Ok(serde_json::to_string(&msg)?)
}
