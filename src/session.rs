use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio::{AudioChunk, AudioSink, PlaybackConfig, PlaybackLoop};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::net_link::Connector;
use crate::pause_gate::PauseGate;
use crate::reconnect::{ConnectionState, ReconnectSupervisor, RetryBudget};
use crate::transport_bridge::{BridgeHandle, TransportBridge};

// 一个机器人的中继会话：播放循环、传输桥和重连管理器
pub struct RelaySession {
    gate: Arc<PauseGate>,
    bridge: BridgeHandle,
    playback: Option<PlaybackLoop>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    supervisor: Option<JoinHandle<Result<()>>>,
}

impl RelaySession {
    /// Starts playback and begins dialing. Must be called inside a tokio
    /// runtime.
    pub fn start<S: AudioSink>(
        config: &RelayConfig,
        connector: Arc<dyn Connector>,
        sink: S,
    ) -> Result<Self> {
        Self::start_with_budget(config, connector, sink, RetryBudget::default())
    }

    pub fn start_with_budget<S: AudioSink>(
        config: &RelayConfig,
        connector: Arc<dyn Connector>,
        sink: S,
        budget: RetryBudget,
    ) -> Result<Self> {
        let gate = Arc::new(PauseGate::new());
        let playback = PlaybackLoop::start(
            PlaybackConfig {
                output_sample_rate: config.output_sample_rate(),
                chunk_pacing: config.audio.chunk_pacing,
            },
            gate.clone(),
            sink,
        )?;

        // 关闭信号，由 shutdown() 触发
        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = ReconnectSupervisor::new(connector, budget, shutdown_rx);
        let state = supervisor.subscribe();

        let mut transport = TransportBridge::new(
            config.network.bot_id.clone(),
            config.audio.sample_rate,
            gate.clone(),
            playback.queue(),
            config.threshold(),
            state.clone(),
        );
        let bridge = transport.handle();

        log::info!(
            "Relay session starting: bot_id={}, rate={}Hz, auto-pause threshold={:?}",
            config.network.bot_id,
            config.audio.sample_rate,
            config.audio.pause_threshold,
        );

        let supervisor = tokio::spawn(async move { supervisor.run(&mut transport).await });

        Ok(Self {
            gate,
            bridge,
            playback: Some(playback),
            state,
            shutdown,
            supervisor: Some(supervisor),
        })
    }

    pub fn on_mixed_frame(&self, frame: &AudioChunk) {
        self.bridge.on_mixed_frame(frame);
    }

    pub fn mixed_audio_tap(&self) -> BridgeHandle {
        self.bridge.clone()
    }

    pub fn pause_gate(&self) -> Arc<PauseGate> {
        self.gate.clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves when the supervisor stops on its own, i.e. with
    /// `RetryBudgetExhausted`. Safe to cancel and call again.
    pub async fn closed(&mut self) -> Result<()> {
        let Some(handle) = self.supervisor.as_mut() else {
            return Ok(());
        };
        let outcome = handle.await;
        self.supervisor = None;
        flatten(outcome)
    }

    /// Stops dialing, closes the connection, stops playback and discards any
    /// queued audio.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let outcome = match self.supervisor.take() {
            Some(handle) => flatten(handle.await),
            None => Ok(()),
        };

        // 播放线程的 join 是阻塞的，放到 blocking 线程池
        if let Some(mut playback) = self.playback.take() {
            tokio::task::spawn_blocking(move || playback.stop())
                .await
                .map_err(|e| RelayError::Connection(format!("playback shutdown failed: {e}")))?;
        }

        log::info!("Relay session stopped");
        outcome
    }
}

fn flatten(outcome: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    outcome.map_err(|e| RelayError::Connection(format!("supervisor task failed: {e}")))?
}
