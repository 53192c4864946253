use crate::error::AppError;
use crate::stream::types::{HistoryWire, Sample};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

const MAX_MESSAGE_SIZE: usize = 16 << 20;
const MAX_FRAME_SIZE: usize = 4 << 20;

pub type SensorWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Payload(Vec<u8>),
    /// The session ended. Carries the close reason or transport error, if any.
    Closed(Option<String>),
}

/// One open transport session. After `Closed` is returned the session is spent.
#[async_trait]
pub trait TransportSession: Send {
    async fn next_frame(&mut self) -> TransportFrame;
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportSession>, AppError>;
}

#[async_trait]
pub trait HistorySource: Send + Sync + 'static {
    async fn fetch_history(&self) -> Result<Vec<Sample>, AppError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportSession>, AppError> {
        let stream = connect_sensor_stream(url).await?;
        Ok(Box::new(WebSocketSession { stream }))
    }
}

pub async fn connect_sensor_stream(url: &str) -> Result<SensorWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

pub struct WebSocketSession {
    stream: SensorWsStream,
}

#[async_trait]
impl TransportSession for WebSocketSession {
    async fn next_frame(&mut self) -> TransportFrame {
        loop {
            let Some(frame_result) = self.stream.next().await else {
                return TransportFrame::Closed(None);
            };

            match frame_result {
                Ok(Message::Text(text_payload)) => {
                    return TransportFrame::Payload(text_payload.into_bytes())
                }
                Ok(Message::Binary(binary_payload)) => {
                    return TransportFrame::Payload(binary_payload)
                }
                Ok(Message::Close(frame)) => {
                    return TransportFrame::Closed(frame.and_then(|frame| {
                        let reason = frame.reason.trim();
                        (!reason.is_empty()).then(|| reason.to_string())
                    }))
                }
                Ok(_) => continue,
                Err(error) => {
                    return TransportFrame::Closed(Some(format!("websocket frame error: {error}")))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(error) = self.stream.close(None).await {
            debug!(%error, "websocket close handshake did not complete");
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpHistorySource {
    client: Client,
    url: String,
}

impl HttpHistorySource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_history(&self) -> Result<Vec<Sample>, AppError> {
        fetch_sample_history(&self.client, &self.url).await
    }
}

pub async fn fetch_sample_history(client: &Client, url: &str) -> Result<Vec<Sample>, AppError> {
    let response = client.get(url).send().await?.error_for_status()?;
    let payload = response.json::<HistoryWire>().await?;
    payload.try_into()
}
