//! Framed WebSocket connections
//!
//! tungstenite reassembles continuation frames itself, so every data
//! message surfaces here as one final frame.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{Frame, FrameConnector, FrameSink, FrameStream};
use crate::error::{Result, WalletError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections with tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl FrameConnector for WsConnector {
    async fn connect(&self, uri: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (stream, response) = connect_async(uri).await.map_err(WalletError::transport)?;
        debug!("WebSocket connected to {} ({})", uri, response.status());

        let (sink, stream) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsReader { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<()> {
        let message = match String::from_utf8(payload) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink.send(message).await.map_err(WalletError::transport)
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(WalletError::transport)
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsReader {
    async fn receive_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Ok(None);
            };

            match message.map_err(WalletError::transport)? {
                Message::Text(text) => return Ok(Some(Frame::text(text))),
                Message::Binary(data) => return Ok(Some(Frame::fragment(data, true))),
                Message::Close(_) => return Ok(Some(Frame::close())),
                // tungstenite queues the pong reply itself
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Frame(frame) => {
                    return Ok(Some(Frame::fragment(frame.into_data(), true)));
                }
            }
        }
    }
}
