use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::NetworkConfig;
use crate::error::{RelayError, Result};

// 与远端代理之间的一条消息连接
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text message, or `None` once the peer has closed the connection.
    async fn receive(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) -> Result<()>;
}

// 由重连管理器调用，每次拨号返回一条新连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn Connection>>;
}

fn connection_error(e: impl std::fmt::Display) -> RelayError {
    RelayError::Connection(e.to_string())
}

// WebSocket 拨号器
pub struct WsConnector {
    url: Url,
    token: Option<String>,
    bot_id: String,
}

impl WsConnector {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let url = Url::parse(&config.ws_url)
            .map_err(|e| RelayError::Config(format!("ws_url: {e}")))?;
        Ok(Self {
            url,
            token: config.ws_token.clone().filter(|t| !t.is_empty()), // 空 token 视为未配置
            bot_id: config.bot_id.clone(),
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn dial(&self) -> Result<Box<dyn Connection>> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| RelayError::Config("ws_url has no host".into()))?;
        let host = match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        // 根据配置构建WebSocket请求
        let mut request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Bot-Id", &self.bot_id);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let request = request.body(()).map_err(connection_error)?;

        log::info!("Connecting to {}...", self.url);
        let (stream, _) = connect_async(request).await.map_err(connection_error)?;
        log::info!("Connected to {}", self.url);

        Ok(Box::new(WsConnection { stream }))
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(connection_error)
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                // 协议只使用文本帧，二进制帧忽略
                Some(Ok(Message::Binary(data))) => {
                    log::debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Server closed connection: {:?}", frame);
                    return Ok(None);
                }
                // Ping/Pong 由 tungstenite 自动应答
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(connection_error(e)),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await.map_err(connection_error)
    }
}
