//! Framed parent↔child binary IPC (§4.A).
//!
//! Wire format: `[4-byte big-endian length][payload]`. The payload is a
//! `prost`-encoded [`envelope::Envelope`]. A zero-length frame is an error;
//! anything above [`MAX_FRAME_LEN`] is rejected outright rather than causing
//! an unbounded allocation.

pub mod envelope;

pub use envelope::{Envelope, MessageType, Payload};

use prost::Message;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Frames larger than this are rejected without being read into memory.
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("zero-length frame")]
    ZeroLength,
    #[error("frame length {0} exceeds maximum of {MAX_FRAME_LEN}")]
    TooLarge(u32),
    /// The peer closed the pipe cleanly between frames (EOF on the length
    /// prefix itself, not a short read mid-payload).
    #[error("peer closed the pipe")]
    PeerClosed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reads length-prefixed envelopes from an `AsyncRead` stream.
pub struct FramedReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame and decode it as an `Envelope`. Returns
    /// `Err(FrameError::PeerClosed)` when the stream ends cleanly before any
    /// byte of the next length prefix arrives.
    pub async fn read_envelope(&mut self) -> Result<Envelope, FrameError> {
        let bytes = self.read_frame().await?;
        Envelope::decode(bytes.as_slice())
            .map_err(|e| FrameError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Read one raw frame (length-prefixed payload bytes).
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::PeerClosed);
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Err(FrameError::ZeroLength);
        }
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;
        Ok(payload)
    }
}

/// Writes length-prefixed envelopes to an `AsyncWrite` stream, serialized
/// behind a single mutex so two writers can never interleave a frame.
pub struct FramedWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub async fn write_payload(&self, payload: &Payload) -> Result<(), FrameError> {
        self.write_envelope(&payload.encode_envelope()).await
    }

    pub async fn write_envelope(&self, envelope: &Envelope) -> Result<(), FrameError> {
        let bytes = envelope.encode_to_vec();
        self.write_frame(&bytes).await
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<(), FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::ZeroLength);
        }
        let len = u32::try_from(bytes.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        let mut guard = self.inner.lock().await;
        guard.write_all(&len.to_be_bytes()).await?;
        guard.write_all(bytes).await?;
        guard.flush().await?;
        Ok(())
    }
}

/// Read envelopes in a loop, dispatching each decoded payload to `on_payload`
/// and logging-and-continuing on malformed or unrecognized frames, per the
/// §4.A failure semantics. Returns when the peer closes the pipe cleanly or
/// a non-EOF read error occurs (the latter should be treated by the caller
/// as a child-crash equivalent).
pub async fn read_loop<R, F>(
    mut reader: FramedReader<R>,
    mut on_payload: F,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    F: FnMut(Payload),
{
    loop {
        let envelope = match reader.read_envelope_or_frame_error().await {
            Ok(envelope) => envelope,
            Err(FrameError::PeerClosed) => {
                debug!("IPC peer closed the pipe cleanly");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match Payload::decode_envelope(&envelope) {
            Ok(Some(payload)) => on_payload(payload),
            Ok(None) => {
                warn!(message_type = envelope.message_type, "ignoring unrecognized IPC message type");
            }
            Err(e) => {
                warn!(error = %e, "ignoring malformed IPC payload");
            }
        }
    }
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Like `read_envelope`, but a malformed envelope at the prost layer is
    /// surfaced as a frame with an unparseable payload rather than an error,
    /// so `read_loop` can apply the "log and continue" policy uniformly for
    /// both unknown-type and malformed-payload frames.
    async fn read_envelope_or_frame_error(&mut self) -> Result<Envelope, FrameError> {
        let bytes = self.read_frame().await?;
        match Envelope::decode(bytes.as_slice()) {
            Ok(envelope) => Ok(envelope),
            Err(_) => Ok(Envelope {
                message_type: -1,
                payload: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envelope::{Payload, StopSession};
    use std::io::Cursor;

    #[tokio::test]
    async fn writer_then_reader_round_trips_a_payload() {
        let mut buf = Vec::new();
        {
            let writer = FramedWriter::new(&mut buf);
            writer
                .write_payload(&Payload::StopSession(StopSession { task_id: "T".into() }))
                .await
                .unwrap();
        }
        let mut reader = FramedReader::new(Cursor::new(buf));
        let envelope = reader.read_envelope().await.unwrap();
        let payload = Payload::decode_envelope(&envelope).unwrap().unwrap();
        assert_eq!(payload, Payload::StopSession(StopSession { task_id: "T".into() }));
    }

    #[tokio::test]
    async fn zero_length_frame_is_an_error() {
        let buf = 0u32.to_be_bytes().to_vec();
        let mut reader = FramedReader::new(Cursor::new(buf));
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::ZeroLength)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_payload() {
        let mut buf = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]); // short trailing bytes; must not be read
        let mut reader = FramedReader::new(Cursor::new(buf));
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn eof_on_length_prefix_is_reported_as_peer_closed() {
        let mut reader = FramedReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn short_read_on_payload_is_an_io_error_not_peer_closed() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3]); // promised 10 bytes, only 3 present
        let mut reader = FramedReader::new(Cursor::new(buf));
        match reader.read_frame().await {
            Err(FrameError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected short-read I/O error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_loop_skips_unknown_message_type_and_continues() {
        let mut buf = Vec::new();
        {
            let writer = FramedWriter::new(&mut buf);
            writer
                .write_envelope(&Envelope {
                    message_type: 999,
                    payload: vec![],
                })
                .await
                .unwrap();
            writer
                .write_payload(&Payload::StopSession(StopSession { task_id: "T".into() }))
                .await
                .unwrap();
        }
        let reader = FramedReader::new(Cursor::new(buf));
        let mut seen = Vec::new();
        read_loop(reader, |payload| seen.push(payload)).await.unwrap();
        assert_eq!(seen, vec![Payload::StopSession(StopSession { task_id: "T".into() })]);
    }
}
