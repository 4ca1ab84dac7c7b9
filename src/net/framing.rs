//! Message framing for the length-prefixed protocol
//!
//! Format: `[4 bytes little-endian length][1 byte kind][body]`, where the
//! length counts the kind byte plus the body.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound for kind byte + body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65536;

/// Separates coalesced documents inside one data frame
pub const DELIMITER: u8 = b'\n';

const HEADER_LEN: usize = 4;

/// Frame kinds on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    Close = 0x04,
}

impl TryFrom<u8> for FrameKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Ping),
            0x03 => Ok(Self::Pong),
            0x04 => Ok(Self::Close),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    /// The stream is still aligned on a frame boundary after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::EmptyFrame | Self::UnknownKind(_))
    }
}

fn map_eof(e: io::Error) -> FramingError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FramingError::ConnectionClosed
    } else {
        FramingError::Io(e)
    }
}

/// Read one frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_frame_size: usize,
) -> Result<Frame, FramingError> {
    let mut len_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let len = u32::from_le_bytes(len_buf) as usize;

    // An oversized length cannot be skipped safely
    if len > max_frame_size {
        return Err(FramingError::FrameTooLarge(len, max_frame_size));
    }

    if len == 0 {
        return Err(FramingError::EmptyFrame);
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(map_eof)?;

    let kind = FrameKind::try_from(buf[0])?;
    buf.remove(0);
    Ok(Frame { kind, body: buf })
}

/// Append one encoded frame to `out`
pub fn encode_frame(
    out: &mut Vec<u8>,
    kind: FrameKind,
    body: &[u8],
    max_frame_size: usize,
) -> Result<(), FramingError> {
    let len = body.len() + 1;
    if len > max_frame_size {
        return Err(FramingError::FrameTooLarge(len, max_frame_size));
    }

    out.reserve(HEADER_LEN + len);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(body);
    Ok(())
}

/// Write a single frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    kind: FrameKind,
    body: &[u8],
    max_frame_size: usize,
) -> Result<(), FramingError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 1 + body.len());
    encode_frame(&mut buf, kind, body, max_frame_size)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Split a data frame body into its non-empty documents
pub fn documents(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    body.split(|b| *b == DELIMITER)
        .filter(|doc| !doc.iter().all(u8::is_ascii_whitespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: usize = DEFAULT_MAX_FRAME_SIZE;

    #[tokio::test]
    async fn test_read_write_frame() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, FrameKind::Data, b"Hello, World!", MAX).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let frame = read_frame(&mut cursor, MAX).await.unwrap();

        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.body, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_control_frame_has_empty_body() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, FrameKind::Ping, b"", MAX).await.unwrap();
        assert_eq!(buffer, vec![1, 0, 0, 0, 0x02]);

        let frame = read_frame(&mut Cursor::new(buffer), MAX).await.unwrap();
        assert_eq!(frame.kind, FrameKind::Ping);
        assert!(frame.body.is_empty());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let large = vec![0u8; MAX];
        let mut buffer = Vec::new();

        let result = write_frame(&mut buffer, FrameKind::Data, &large, MAX).await;
        assert!(matches!(result, Err(FramingError::FrameTooLarge(_, _))));

        let mut header = (MAX as u32 + 1).to_le_bytes().to_vec();
        header.push(0x01);
        let result = read_frame(&mut Cursor::new(header), MAX).await;
        assert!(matches!(result, Err(FramingError::FrameTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_recoverable_errors_keep_alignment() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&0u32.to_le_bytes());
        buffer.extend_from_slice(&2u32.to_le_bytes());
        buffer.extend_from_slice(&[0x7f, b'x']);
        write_frame(&mut buffer, FrameKind::Pong, b"", MAX).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let empty = read_frame(&mut cursor, MAX).await.unwrap_err();
        assert!(matches!(empty, FramingError::EmptyFrame));
        assert!(empty.is_recoverable());

        let unknown = read_frame(&mut cursor, MAX).await.unwrap_err();
        assert!(matches!(unknown, FramingError::UnknownKind(0x7f)));
        assert!(unknown.is_recoverable());

        let next = read_frame(&mut cursor, MAX).await.unwrap();
        assert_eq!(next.kind, FrameKind::Pong);
    }

    #[tokio::test]
    async fn test_read_truncated_length() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        let result = read_frame(&mut cursor, MAX).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_body() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3]);

        let result = read_frame(&mut Cursor::new(buffer), MAX).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_multiple_frames_in_one_buffer() {
        let mut buffer = Vec::new();
        encode_frame(&mut buffer, FrameKind::Data, b"first", MAX).unwrap();
        encode_frame(&mut buffer, FrameKind::Ping, b"", MAX).unwrap();
        encode_frame(&mut buffer, FrameKind::Data, b"third", MAX).unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor, MAX).await.unwrap().body, b"first");
        assert_eq!(read_frame(&mut cursor, MAX).await.unwrap().kind, FrameKind::Ping);
        assert_eq!(read_frame(&mut cursor, MAX).await.unwrap().body, b"third");
    }

    #[tokio::test]
    async fn test_read_frame_across_partial_reads() {
        // Header and body arrive in pieces, as they do off a real socket
        let mut stream = tokio_test::io::Builder::new()
            .read(&[6, 0])
            .read(&[0, 0, 0x01, b'h'])
            .read(b"ell")
            .read(b"o")
            .build();

        let frame = read_frame(&mut stream, MAX).await.unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.body, b"hello");
    }

    #[tokio::test]
    async fn test_read_io_error_is_fatal() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&[3, 0, 0, 0])
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let err = read_frame(&mut stream, MAX).await.unwrap_err();
        assert!(matches!(err, FramingError::Io(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_write_frame_is_single_write() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[3, 0, 0, 0, 0x01, b'o', b'k'])
            .build();

        write_frame(&mut stream, FrameKind::Data, b"ok", MAX).await.unwrap();
    }

    #[test]
    fn test_documents_skips_blank_lines() {
        let body = b"{\"a\":1}\n\n  \n{\"b\":2}\n";
        let docs: Vec<_> = documents(body).collect();
        assert_eq!(docs, vec![&b"{\"a\":1}"[..], &b"{\"b\":2}"[..]]);
    }
}
