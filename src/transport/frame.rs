//! Length-prefixed framing for the TCP transport.
//!
//! Each message is a 4-byte big-endian length followed by that many payload
//! bytes. Anything larger than [`MAX_FRAME_SIZE`] is refused on both sides,
//! a corrupt prefix must not turn into a giant allocation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{BusError, Result};

/// Upper bound on a single framed payload.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Write one framed payload and flush it.
pub async fn write_frame(writer: &mut (impl AsyncWrite + Unpin), payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(BusError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let prefix = (payload.len() as u32).to_be_bytes();
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed payload.
///
/// `Ok(None)` is a clean close, the peer went away between frames. EOF in
/// the middle of a frame is reported as [`BusError::ConnectionClosed`].
pub async fn read_frame(reader: &mut (impl AsyncRead + Unpin)) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(prefix) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(BusError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BusError::ConnectionClosed
        } else {
            BusError::from(e)
        }
    })?;

    Ok(Some(payload))
}
