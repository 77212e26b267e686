//! Length-prefixed framing.
//!
//! Wire format: `[4-byte length as u32 big-endian] + [frame bytes]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{DistobjError, Result};

/// Default maximum frame size (100 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Writes one frame with its length prefix.
///
/// # Arguments
///
/// * `writer` - The stream to write to
/// * `data` - The frame contents
/// * `max_size` - Largest frame the peer is expected to accept
///
/// # Errors
///
/// Returns `MessageTooLarge` before writing anything if `data` exceeds
/// `max_size`, or `ConnectionLost` if the stream fails.
pub async fn write_frame<W>(writer: &mut W, data: &[u8], max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > max_size {
        return Err(DistobjError::MessageTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    let len = data.len() as u32;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
/// A stream that ends inside a frame, length prefix included, is an error.
///
/// # Errors
///
/// Returns an error if:
/// - The announced length exceeds `max_size`
/// - The stream ends or fails mid-frame
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let read = reader
            .read(&mut len_buf[filled..])
            .await
            .map_err(|e| map_io_error(e, "reading length prefix"))?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DistobjError::ConnectionLost(format!(
                "stream ended after {} of 4 length prefix bytes",
                filled
            )));
        }
        filled += read;
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate length to prevent allocation of excessively large buffers
    if len > max_size {
        return Err(DistobjError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading frame"))?;

    Ok(Some(buf))
}

/// Map IO errors to appropriate DistobjError variants
///
/// Anything that means the peer is gone becomes `ConnectionLost`; the rest
/// stays an `Io` error.
pub fn map_io_error(err: std::io::Error, context: &str) -> DistobjError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected => {
            DistobjError::ConnectionLost(format!("{}: {}", context, err))
        }
        _ => DistobjError::Io(err),
    }
}
