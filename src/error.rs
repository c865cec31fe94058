use thiserror::Error;

/// All errors produced by the relay library.
///
/// Per-chunk and per-message variants (`MalformedAudio`, `Protocol`,
/// `SinkEmission`, `Resample`) are absorbed and logged where they occur.
/// `Connection` feeds the reconnect state machine. Only
/// `RetryBudgetExhausted` is returned to the hosting session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed audio: {len} bytes is not a multiple of the {width}-byte sample width")]
    MalformedAudio { len: usize, width: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("audio sink emission failed: {0}")]
    SinkEmission(String),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("reconnect budget exhausted after {attempts} consecutive failures")]
    RetryBudgetExhausted { attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
