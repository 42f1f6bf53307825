use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::Frame;
use crate::transport::codec::FrameCodec;

/// Upper bound on a single encoded frame (100 MB).
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Default timeout for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a TCP connection to `addr` within `timeout`.
///
/// A bare `:port` address is taken to mean the local host.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let target = if addr.starts_with(':') {
        format!("127.0.0.1{}", addr)
    } else {
        addr.to_string()
    };

    let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| {
            RpcError::Connection(format!(
                "Timed out connecting to {} after {}ms",
                addr,
                timeout.as_millis()
            ))
        })?
        .map_err(|e| RpcError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

    stream
        .set_nodelay(true)
        .map_err(|e| RpcError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

    Ok(stream)
}

/// Writes one frame.
///
/// Wire format: `[4-byte length as u32 big-endian] + [postcard frame]`
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = FrameCodec::encode(frame)?;
    if encoded.len() > MAX_FRAME_SIZE {
        return Err(RpcError::MessageTooLarge {
            size: encoded.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = encoded.len() as u32;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the connection
/// cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading frame"))?;

    FrameCodec::decode(&buf).map(Some)
}

/// Maps IO errors onto the connection/transport variants.
fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            RpcError::Connection(format!("{}: Connection lost", context))
        }
        _ => RpcError::Io(err),
    }
}
