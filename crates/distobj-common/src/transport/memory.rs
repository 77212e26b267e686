//! In-process transport built on tokio channels.

use tokio::sync::mpsc;

use crate::protocol::error::{DistobjError, Result};
use crate::transport::{FrameSink, FrameSource, Transport};

/// One end of an in-memory link. Frames sent on one end arrive, in order, at
/// the other.
pub struct MemoryTransport {
    sink: MemoryFrameSink,
    source: MemoryFrameSource,
}

impl MemoryTransport {
    /// Creates two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                sink: MemoryFrameSink { tx: Some(a_tx) },
                source: MemoryFrameSource { rx: b_rx },
            },
            MemoryTransport {
                sink: MemoryFrameSink { tx: Some(b_tx) },
                source: MemoryFrameSource { rx: a_rx },
            },
        )
    }
}

impl Transport for MemoryTransport {
    type Sink = MemoryFrameSink;
    type Source = MemoryFrameSource;

    fn split(self) -> (MemoryFrameSink, MemoryFrameSource) {
        (self.sink, self.source)
    }
}

pub struct MemoryFrameSink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl FrameSink for MemoryFrameSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| DistobjError::ConnectionLost("sink closed".into()))?;
        tx.send(frame)
            .map_err(|_| DistobjError::ConnectionLost("peer dropped its end".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

pub struct MemoryFrameSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl FrameSource for MemoryFrameSource {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}
