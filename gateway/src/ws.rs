//! axum WebSocket adapter for the client pumps

use crate::client::{Frame, FrameSink, FrameSource};
use crate::error::TransportError;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

/// Split an upgraded socket into pump halves
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsSource(stream))
}

/// Write half
pub struct WsSink(SplitSink<WebSocket, Message>);

/// Read half
pub struct WsSource(SplitStream<WebSocket>);

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(raw) => Message::Text(String::from_utf8_lossy(&raw).into_owned().into()),
        Frame::Binary(raw) => Message::Binary(raw),
        Frame::Ping(raw) => Message::Ping(raw),
        Frame::Pong(raw) => Message::Pong(raw),
        Frame::Close => Message::Close(None),
    }
}

fn io_error(err: axum::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.0.send(to_message(frame)).await.map_err(io_error)
    }

    async fn send_all(&mut self, frames: Vec<Frame>) -> Result<(), TransportError> {
        for frame in frames {
            self.0.feed(to_message(frame)).await.map_err(io_error)?;
        }
        self.0.flush().await.map_err(io_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Peer may already be gone; the close frame is best effort
        let _ = self.0.send(Message::Close(None)).await;
        self.0.close().await.map_err(io_error)
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(io_error(e))),
        };
        let frame = match message {
            Message::Text(text) => Frame::Text(text.as_str().as_bytes().to_vec().into()),
            Message::Binary(raw) => Frame::Binary(raw),
            Message::Ping(raw) => Frame::Ping(raw),
            Message::Pong(raw) => Frame::Pong(raw),
            Message::Close(_) => Frame::Close,
        };
        Some(Ok(frame))
    }
}
