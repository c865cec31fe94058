//! Realtime audio relay for a meeting bot.
//!
//! Streams mixed meeting audio to a remote agent, plays the agent's audio
//! back into the meeting, and holds that playback while participants are
//! speaking or when the agent asks for a pause.

pub mod audio;
pub mod audio_bridge;
pub mod config;
pub mod error;
pub mod net_link;
pub mod pause_gate;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transport_bridge;

pub use audio::{estimate_level, AudioChunk, AudioSink, SampleEncoding};
pub use config::{RelayConfig, ThresholdConfig};
pub use error::{RelayError, Result};
pub use net_link::{Connection, Connector, WsConnector};
pub use pause_gate::{Clock, PauseGate, SystemClock};
pub use reconnect::{ConnectionState, ReconnectSupervisor, RetryBudget};
pub use session::RelaySession;
pub use transport_bridge::{BridgeHandle, TransportBridge};
