//! Transport seam between the client actor and a concrete socket
//!
//! The pumps only see [`Frame`]s. The axum WebSocket adapter lives in
//! [`crate::ws`]; tests plug in channel-backed implementations.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;

/// A transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 JSON envelope
    Text(Bytes),
    /// Opaque binary payload
    Binary(Bytes),
    /// Liveness probe
    Ping(Bytes),
    /// Liveness reply
    Pong(Bytes),
    /// Orderly shutdown
    Close,
}

/// Write half of a connection; owned by the writer pump alone
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write and flush one frame
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Write several frames with a single flush
    ///
    /// The default sends them one at a time.
    async fn send_all(&mut self, frames: Vec<Frame>) -> Result<(), TransportError> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    /// Send a close frame and release the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection; owned by the reader pump alone
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` once the peer has gone away
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}
