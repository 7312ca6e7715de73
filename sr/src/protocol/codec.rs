//! Newline-delimited record framing
//!
//! Bytes are accumulated and split on `\n`; every complete segment is decoded
//! on its own, so one bad record never poisons the ones around it.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::RelayError;

/// Read chunk size for framed readers
const READ_CHUNK: usize = 8192;

/// Default cap on an unterminated frame (1MB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental splitter for newline-delimited frames
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// Append raw bytes read from the transport
    ///
    /// Fails when the bytes after the last delimiter exceed the frame cap.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        self.buf.extend_from_slice(bytes);

        let pending = match self.buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => self.buf.len() - pos - 1,
            None => self.buf.len(),
        };
        if pending > self.max_frame {
            return Err(RelayError::FrameTooLarge {
                len: pending,
                max: self.max_frame,
            });
        }
        Ok(())
    }

    /// Pop the next complete, non-blank segment without its delimiter
    pub fn next_segment(&mut self) -> Option<Vec<u8>> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let mut segment: Vec<u8> = self.buf.drain(..=pos).collect();
            segment.pop();
            if segment.last() == Some(&b'\r') {
                segment.pop();
            }
            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(segment);
        }
    }

    /// Decode every complete segment currently buffered
    pub fn decode_all<T: DeserializeOwned>(&mut self) -> Vec<Result<T, RelayError>> {
        let mut out = Vec::new();
        while let Some(segment) = self.next_segment() {
            out.push(decode_segment(&segment));
        }
        out
    }

    /// Bytes held that do not yet form a complete frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Decode one segment as a record of type `T`
pub fn decode_segment<T: DeserializeOwned>(segment: &[u8]) -> Result<T, RelayError> {
    let text = std::str::from_utf8(segment).map_err(|_| RelayError::InvalidUtf8)?;
    serde_json::from_str(text.trim()).map_err(|source| RelayError::Decode {
        line: text.chars().take(100).collect(),
        source,
    })
}

/// Serialize a record followed by exactly one delimiter
pub fn encode_frame<T: Serialize>(record: &T) -> Result<Vec<u8>, RelayError> {
    let mut bytes = serde_json::to_vec(record)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write one framed record and flush
pub async fn write_frame<W, T>(writer: &mut W, record: &T) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(record)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Async source of frames over any byte stream
pub struct FramedReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R, max_frame: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_frame),
        }
    }

    /// Wait for the next complete segment
    ///
    /// A zero-length read yields `PeerClosed`; transport errors propagate.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, RelayError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(segment) = self.decoder.next_segment() {
                return Ok(segment);
            }
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                debug!(pending = self.decoder.pending(), "FramedReader::next_frame: peer closed");
                return Err(RelayError::PeerClosed);
            }
            self.decoder.push(&chunk[..n])?;
        }
    }

    /// Wait for the next segment and decode it as `T`
    ///
    /// The outer result is the transport outcome, the inner one the decode
    /// outcome of that single record.
    pub async fn next_record<T: DeserializeOwned>(&mut self) -> Result<Result<T, RelayError>, RelayError> {
        let segment = self.next_frame().await?;
        Ok(decode_segment(&segment))
    }
}
