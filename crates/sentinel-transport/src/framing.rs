//! Length-prefixed wire framing.
//!
//! Every stream carrier frames payloads as `len(4B BE) ‖ payload` with a
//! 100 MiB ceiling. A zero-length payload is a valid frame. Frames above
//! the ceiling are a protocol violation and close the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_SIZE;
use crate::error::TransportError;

/// Write one framed payload.
///
/// # Errors
///
/// [`TransportError::Oversize`] when the payload exceeds the frame ceiling,
/// otherwise I/O errors from the underlying stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Oversize(payload.len()));
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one framed payload, enforcing `max` as the size ceiling.
///
/// # Errors
///
/// [`TransportError::Oversize`] for frames above `max` (the caller must
/// drop the connection), [`TransportError::Io`] for stream errors
/// including clean EOF (`UnexpectedEof`).
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max {
        return Err(TransportError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frame").await.unwrap();

        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(payload, b"hello frame");
    }

    #[tokio::test]
    async fn test_zero_length_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);

        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor, MAX_FRAME_SIZE).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one").await.unwrap();
        write_frame(&mut buf, b"two").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, MAX_FRAME_SIZE).await.unwrap(), b"one");
        assert_eq!(read_frame(&mut cursor, MAX_FRAME_SIZE).await.unwrap(), b"two");
        assert!(read_frame(&mut cursor, MAX_FRAME_SIZE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_length_rejected() {
        let len = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        match read_frame(&mut cursor, MAX_FRAME_SIZE).await {
            Err(TransportError::Oversize(n)) => assert_eq!(n, MAX_FRAME_SIZE + 1),
            other => panic!("expected oversize error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_boundary_sizes() {
        // One byte below the ceiling is representable; use a small custom
        // ceiling to keep the test cheap.
        let max = 1024;
        let payload = vec![0xAB; max];
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, max).await.unwrap(), payload);

        let over = ((max + 1) as u32).to_be_bytes();
        let mut cursor = Cursor::new(over.to_vec());
        assert!(matches!(
            read_frame(&mut cursor, max).await,
            Err(TransportError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_io_error() {
        // Length says 8 bytes but only 3 follow.
        let mut buf = 8u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor, MAX_FRAME_SIZE).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_oversize_write_rejected() {
        // Writing above the ceiling must fail before touching the stream.
        struct NoWrite;
        impl tokio::io::AsyncWrite for NoWrite {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
                _: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                panic!("stream must not be touched");
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        let mut sink = NoWrite;
        assert!(matches!(
            write_frame(&mut sink, &huge).await,
            Err(TransportError::Oversize(_))
        ));
    }
}
