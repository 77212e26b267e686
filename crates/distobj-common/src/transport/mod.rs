//! Distobj Transport Layer
//!
//! A transport moves opaque frames between two peers, in order and without
//! loss, until it closes. The connection layer above never sees bytes on a
//! socket, only whole frames.
//!
//! # Components
//!
//! - **[`FrameSink`]** / **[`FrameSource`]**: the two halves of a transport
//! - **[`TcpTransport`]**: length-prefixed frames over a TCP stream
//! - **[`MemoryTransport`]**: an in-process pair, for tests and embedding
//!
//! # Message Size Limits
//!
//! TCP framing enforces a maximum frame size (100 MB by default) so a
//! corrupt length prefix cannot trigger an enormous allocation.

use std::future::Future;

use crate::protocol::error::Result;

pub mod framing;
pub mod memory;
pub mod tcp;

pub use framing::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
pub use memory::{MemoryFrameSink, MemoryFrameSource, MemoryTransport};
pub use tcp::{TcpFrameSink, TcpFrameSource, TcpTransport};

/// Sending half of a transport.
pub trait FrameSink: Send + 'static {
    fn send_frame(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Flushes and closes the sending direction. The peer's source then
    /// reports end of stream.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Receiving half of a transport.
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` once the peer has closed.
    fn recv_frame(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
}

/// A bidirectional frame transport that can be split into its halves.
pub trait Transport: Send + 'static {
    type Sink: FrameSink;
    type Source: FrameSource;

    fn split(self) -> (Self::Sink, Self::Source);
}
