use std::net::ToSocketAddrs;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::protocol::error::{DistobjError, Result};
use crate::transport::framing::{map_io_error, read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::{FrameSink, FrameSource, Transport};

/// Frames over a TCP stream.
///
/// # Wire Protocol
///
/// Every frame is sent with a 4-byte length prefix (big-endian u32):
///
/// ```text
/// [4-byte length] [frame]
/// ```
pub struct TcpTransport {
    stream: TcpStream,
    max_frame_size: usize,
}

impl TcpTransport {
    /// Wraps an established stream (for example one returned by `accept`).
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Connects to a remote endpoint.
    ///
    /// This method resolves the address (which may resolve to multiple addresses)
    /// and attempts to connect to each until one succeeds.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to connect to (e.g., "127.0.0.1:7070")
    pub async fn connect(addr: &str) -> Result<Self> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| DistobjError::ConnectionLost(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(&socket_addr).await {
                Ok(stream) => return Ok(Self::from_stream(stream)),
                Err(e) => last_err = Some(e),
            }
        }

        Err(DistobjError::ConnectionLost(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

impl Transport for TcpTransport {
    type Sink = TcpFrameSink;
    type Source = TcpFrameSource;

    fn split(self) -> (TcpFrameSink, TcpFrameSource) {
        let (read, write) = self.stream.into_split();
        (
            TcpFrameSink {
                write,
                max_frame_size: self.max_frame_size,
            },
            TcpFrameSource {
                read,
                max_frame_size: self.max_frame_size,
            },
        )
    }
}

pub struct TcpFrameSink {
    write: OwnedWriteHalf,
    max_frame_size: usize,
}

impl FrameSink for TcpFrameSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        write_frame(&mut self.write, &frame, self.max_frame_size).await
    }

    async fn close(&mut self) -> Result<()> {
        self.write
            .shutdown()
            .await
            .map_err(|e| map_io_error(e, "shutting down stream"))
    }
}

pub struct TcpFrameSource {
    read: OwnedReadHalf,
    max_frame_size: usize,
}

impl FrameSource for TcpFrameSource {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.read, self.max_frame_size).await
    }
}
