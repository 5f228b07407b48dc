//! Length-delimited frame codec
//!
//! Every message exchanged with a worker is one frame:
//! `[length: u32 BE][msg_type: u8][payload: length - 1 bytes]`.
//! The length counts the type byte plus the payload.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message types for the host/worker protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Host → Worker
    Request = 1,
    Stop = 3,

    // Worker → Host
    Response = 2,
    Ready = 10,
    Log = 11,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Stop),
            10 => Ok(MessageType::Ready),
            11 => Ok(MessageType::Log),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Errors raised while reading or writing frames
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Empty frame")]
    Empty,

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    ///
    /// An unknown message type has had its payload consumed and a bad JSON
    /// payload is a complete frame, so reading can continue. Everything else
    /// leaves the stream unusable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::UnknownType(_) | FrameError::Json(_))
    }
}

/// A single frame received from or sent to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    /// Build a frame with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self, FrameError> {
        Ok(Self::new(msg_type, serde_json::to_vec(data)?))
    }

    /// Value of the length prefix this frame is written with
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Refuse frames longer than `max` before any byte reaches the stream
    pub fn check_len(&self, max: usize) -> Result<u32, FrameError> {
        let len = self.encoded_len();
        if len > max {
            return Err(FrameError::TooLarge { len, max });
        }
        u32::try_from(len).map_err(|_| FrameError::TooLarge { len, max })
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Writes frames to any async byte sink
pub struct FrameWriter<W> {
    inner: W,
    max_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: W, max_len: usize) -> Self {
        Self { inner, max_len }
    }

    /// Send a frame, flushing it before returning
    pub async fn send(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let len_prefix = frame.check_len(self.max_len)?;

        // One buffer per frame so concurrent writers never interleave partial frames.
        let mut buf = Vec::with_capacity(4 + frame.encoded_len());
        buf.extend_from_slice(&len_prefix.to_be_bytes());
        buf.push(frame.msg_type as u8);
        buf.extend_from_slice(&frame.payload);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a frame with a JSON payload
    pub async fn send_json<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        data: &T,
    ) -> Result<(), FrameError> {
        let frame = Frame::json(msg_type, data)?;
        self.send(&frame).await
    }

    /// Shut down the underlying sink
    pub async fn close(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads frames from any async byte source
pub struct FrameReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        Self { inner, max_len }
    }

    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. An EOF in the middle
    /// of a frame is an I/O error.
    pub async fn recv(&mut self) -> Result<Option<Frame>, FrameError> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.inner.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of 4 length bytes", filled),
                )));
            }
            filled += n;
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > self.max_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_len,
            });
        }

        // Read message type (1 byte)
        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;

        // Read payload before validating the type so the stream stays aligned
        let payload_len = len - 1;
        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            self.inner.read_exact(&mut payload).await?;
        }

        let msg_type = MessageType::try_from(type_buf[0])?;
        Ok(Some(Frame::new(msg_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_survive_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .send_json(MessageType::Request, &json!({"id": 1, "method": "ping"}))
            .await
            .unwrap();
        writer.send(&Frame::empty(MessageType::Stop)).await.unwrap();

        let first = reader.recv().await.unwrap().unwrap();
        assert_eq!(first.msg_type, MessageType::Request);
        let body: serde_json::Value = first.parse_json().unwrap();
        assert_eq!(body["method"], "ping");

        let second = reader.recv().await.unwrap().unwrap();
        assert_eq!(second, Frame::empty(MessageType::Stop));
    }

    #[tokio::test]
    async fn test_writer_byte_layout() {
        let mock = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 3, 2, b'{', b'}'])
            .write(&[0, 0, 0, 1, 3])
            .build();
        let mut writer = FrameWriter::new(mock);
        writer.send_json(MessageType::Response, &json!({})).await.unwrap();
        writer.send(&Frame::empty(MessageType::Stop)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_handles_split_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0, 0])
            .read(&[0, 3, 11])
            .read(b"{}")
            .build();
        let mut reader = FrameReader::new(mock);
        let frame = reader.recv().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::Log);
        assert_eq!(frame.payload, b"{}");
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_stream_aligned() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.push(99);
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(MessageType::Ready as u8);

        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(99)));
        assert!(err.is_recoverable());

        let next = reader.recv().await.unwrap().unwrap();
        assert_eq!(next.msg_type, MessageType::Ready);
    }

    #[tokio::test]
    async fn test_oversized_and_empty_frames_are_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1024u32.to_be_bytes());
        let mut reader = FrameReader::with_max_len(&bytes[..], 16);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 1024, max: 16 }));
        assert!(!err.is_recoverable());

        let zero = 0u32.to_be_bytes();
        let mut reader = FrameReader::new(&zero[..]);
        assert!(matches!(reader.recv().await, Err(FrameError::Empty)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_io_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&10u32.to_be_bytes());
        bytes.push(MessageType::Response as u8);
        bytes.extend_from_slice(b"{\"id\"");

        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_partial_length_prefix_is_an_io_error() {
        let bytes = [0u8, 0];
        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.recv().await.unwrap_err();
        match err {
            FrameError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_len_counts_the_type_byte() {
        let frame = Frame::new(MessageType::Request, vec![0; 7]);
        assert_eq!(frame.check_len(8).unwrap(), 8);
        assert!(matches!(
            frame.check_len(7),
            Err(FrameError::TooLarge { len: 8, max: 7 })
        ));
    }

    #[tokio::test]
    async fn test_writer_refuses_frames_over_limit() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::with_max_len(client, 8);
        let err = writer
            .send(&Frame::new(MessageType::Request, vec![0; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }
}
