use std::net::UdpSocket as StdUdpSocket;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::audio::{AudioChunk, AudioSink, SampleEncoding};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::transport_bridge::BridgeHandle;

// 数据包格式：1字节编码标记（0 = i16 LE, 1 = f32 LE），其后为采样数据
pub fn decode_frame(datagram: &[u8], sample_rate: u32) -> Option<AudioChunk> {
    let (&tag, samples) = datagram.split_first()?;
    let encoding = SampleEncoding::from_tag(tag)?;
    Some(AudioChunk::new(samples.to_vec(), sample_rate, encoding))
}

// 接收会议音频进程发来的混合音频帧
pub struct AudioBridge {
    socket: Arc<UdpSocket>,
    sample_rate: u32,
    buffer_size: usize,
}

impl AudioBridge {
    pub async fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!(
            "{}:{}",
            config.bridge.local_ip, config.bridge.mixed_audio_port
        ))
        .await?;
        log::info!("AudioBridge listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            sample_rate: config.audio.sample_rate,
            buffer_size: config.bridge.buffer_size,
        })
    }

    pub async fn run(&self, tap: BridgeHandle) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size]; // 缓冲区大小由配置决定
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            match decode_frame(&buf[..len], self.sample_rate) {
                Some(frame) => tap.on_mixed_frame(&frame),
                None => log::warn!("Dropping {} byte datagram with unknown framing", len),
            }
        }
    }
}

// 播放输出：把 16 位 PCM 通过 UDP 发给本地播放进程
// 在播放线程中调用，所以使用阻塞的 std socket
pub struct UdpAudioSink {
    socket: StdUdpSocket,
    target_addr: String,
}

impl UdpAudioSink {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let socket = StdUdpSocket::bind(format!("{}:0", config.bridge.local_ip))?;
        Ok(Self {
            socket,
            target_addr: config.bridge.player_addr.clone(),
        })
    }
}

impl AudioSink for UdpAudioSink {
    fn emit(&mut self, chunk: &AudioChunk) -> Result<()> {
        self.socket
            .send_to(chunk.data(), &self.target_addr)
            .map_err(|e| RelayError::SinkEmission(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_frames() {
        let frame = decode_frame(&[0, 1, 0, 2, 0], 16000).unwrap();
        assert_eq!(frame.encoding(), SampleEncoding::Int16);
        assert_eq!(frame.pcm16_samples().unwrap(), vec![1, 2]);

        let float = decode_frame(&[1, 0, 0, 128, 63], 24000).unwrap();
        assert_eq!(float.encoding(), SampleEncoding::Float32);
        assert_eq!(float.sample_rate(), 24000);
    }

    #[test]
    fn rejects_empty_and_unknown_frames() {
        assert!(decode_frame(&[], 16000).is_none());
        assert!(decode_frame(&[9, 0, 0], 16000).is_none());
    }

    #[test]
    fn sink_sends_pcm_to_player() {
        let player = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let mut config = RelayConfig::from_toml_str("[network]\nws_url = \"ws://127.0.0.1:1\"").unwrap();
        config.bridge.player_addr = player.local_addr().unwrap().to_string();

        let mut sink = UdpAudioSink::new(&config).unwrap();
        sink.emit(&AudioChunk::from_i16_samples(&[1, -1], 16000)).unwrap();

        let mut buf = [0u8; 16];
        player
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let (len, _) = player.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 0, 255, 255]);
    }
}
