use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::protocol::SUPPORTED_SAMPLE_RATES;

/// How long an auto-pause holds playback.
pub const AUTO_PAUSE_DURATION: Duration = Duration::from_millis(800);

/// Environment prefix; `RELAY__AUDIO__PAUSE_THRESHOLD=1200` sets
/// `audio.pause_threshold`.
const ENV_PREFIX: &str = "RELAY";
const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Remote agent endpoint (ws:// or wss://).
    pub ws_url: String,
    /// Sent as a bearer token when set.
    #[serde(default)]
    pub ws_token: Option<String>,
    /// Identifies this bot in outbound messages; generated when empty.
    #[serde(default)]
    pub bot_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    /// Rate of the mixed meeting audio (8000, 16000 or 24000).
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Rate the playback sink expects; defaults to `sample_rate`.
    #[serde(default)]
    pub output_sample_rate: Option<u32>,
    /// RMS level (16-bit scale) at which playback auto-pauses. Unset
    /// disables auto-pause.
    #[serde(default)]
    pub pause_threshold: Option<u32>,
    /// Fraction of each chunk's duration to wait after playing it.
    #[serde(default)]
    pub chunk_pacing: f64,
}

/// Local UDP link to the meeting audio process.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    /// Port on which mixed meeting frames arrive.
    #[serde(default = "default_mixed_audio_port")]
    pub mixed_audio_port: u16,
    /// Where emitted playback chunks are sent.
    #[serde(default = "default_player_addr")]
    pub player_addr: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Auto-pause settings; fixed for the session once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub threshold: u32,
    pub auto_pause_duration: Duration,
}

impl ThresholdConfig {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            auto_pause_duration: AUTO_PAUSE_DURATION,
        }
    }
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_mixed_audio_port() -> u16 {
    5676
}

fn default_player_addr() -> String {
    "127.0.0.1:5677".to_string()
}

fn default_buffer_size() -> usize {
    65536
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            output_sample_rate: None,
            pause_threshold: None,
            chunk_pacing: 0.0,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            local_ip: default_local_ip(),
            mixed_audio_port: default_mixed_audio_port(),
            player_addr: default_player_addr(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl RelayConfig {
    /// Loads `config.toml` (or `$RELAY_CONFIG`) overlaid with `RELAY__*`
    /// environment variables, then validates.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let settings = config::Config::builder()
            .add_source(config::File::from(Path::new(&path)).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let config: RelayConfig = settings
            .try_deserialize()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        config.validated()
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        let config: RelayConfig = settings
            .try_deserialize()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        config.validated()
    }

    fn validated(mut self) -> Result<Self> {
        let url = Url::parse(&self.network.ws_url)
            .map_err(|e| RelayError::Config(format!("ws_url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RelayError::Config(format!(
                "ws_url must use ws or wss, got {}",
                url.scheme()
            )));
        }

        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(RelayError::Config(format!(
                "sample_rate must be one of {:?}, got {}",
                SUPPORTED_SAMPLE_RATES, self.audio.sample_rate
            )));
        }
        if self.audio.output_sample_rate == Some(0) {
            return Err(RelayError::Config("output_sample_rate must be positive".into()));
        }
        if !self.audio.chunk_pacing.is_finite() || self.audio.chunk_pacing < 0.0 {
            return Err(RelayError::Config(format!(
                "chunk_pacing must be a non-negative number, got {}",
                self.audio.chunk_pacing
            )));
        }

        if self.network.bot_id.trim().is_empty() {
            self.network.bot_id = Uuid::new_v4().to_string();
            log::info!("Generated new bot id: {}", self.network.bot_id);
        }
        Ok(self)
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.audio.output_sample_rate.unwrap_or(self.audio.sample_rate)
    }

    /// `None` when auto-pause is disabled.
    pub fn threshold(&self) -> Option<ThresholdConfig> {
        self.audio.pause_threshold.map(ThresholdConfig::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [network]
            ws_url = "wss://agent.example.com/relay"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.output_sample_rate(), 16000);
        assert_eq!(config.threshold(), None);
        assert_eq!(config.bridge.mixed_audio_port, 5676);
        assert!(!config.network.bot_id.is_empty());
    }

    #[test]
    fn threshold_carries_fixed_duration() {
        let config = RelayConfig::from_toml_str(
            r#"
            [network]
            ws_url = "ws://127.0.0.1:9000"
            bot_id = "bot_auto_pause"

            [audio]
            sample_rate = 24000
            output_sample_rate = 48000
            pause_threshold = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.network.bot_id, "bot_auto_pause");
        assert_eq!(config.output_sample_rate(), 48000);
        assert_eq!(
            config.threshold(),
            Some(ThresholdConfig {
                threshold: 1500,
                auto_pause_duration: Duration::from_millis(800),
            })
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let bad = [
            "[network]\nws_url = \"http://example.com\"",
            "[network]\nws_url = \"not a url\"",
            "[network]\nws_url = \"ws://h\"\n[audio]\nsample_rate = 44100",
            "[network]\nws_url = \"ws://h\"\n[audio]\nchunk_pacing = -1.0",
            "[audio]\nsample_rate = 16000",
        ];
        for toml in bad {
            assert!(
                matches!(RelayConfig::from_toml_str(toml), Err(RelayError::Config(_))),
                "accepted {toml}"
            );
        }
    }
}
