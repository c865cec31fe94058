use meeting_audio_relay::audio_bridge::{AudioBridge, UdpAudioSink};
use meeting_audio_relay::{RelayConfig, RelaySession, WsConnector};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let config = RelayConfig::load()?;

    let connector = Arc::new(WsConnector::new(&config.network)?);
    let sink = UdpAudioSink::new(&config)?;
    let mut session = RelaySession::start(&config, connector, sink)?;

    // 接收混合会议音频，转发给传输桥
    let audio_bridge = Arc::new(AudioBridge::new(&config).await?);
    let tap = session.mixed_audio_tap();
    let audio_bridge_clone = audio_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = audio_bridge_clone.run(tap).await {
            log::error!("AudioBridge error: {}", e);
        }
    });

    log::info!("Meeting audio relay started. Bot ID: {}", config.network.bot_id);

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        closed = session.closed() => closed,
    };

    session.shutdown().await?;
    outcome?;
    Ok(())
}
