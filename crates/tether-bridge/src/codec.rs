//! Message framing on a byte stream.
//!
//! Two framings are supported:
//! - length-prefixed: a 4-byte big-endian length followed by that many bytes
//! - lines: one message per `\n`-terminated line, blank lines skipped
//!
//! In both cases the size limit is checked before the body is buffered.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    LengthPrefixed,
    Lines,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn length_prefixed(max_frame_bytes: usize) -> Self {
        Self {
            framing: Framing::LengthPrefixed,
            max_frame_bytes,
        }
    }

    pub fn lines(max_frame_bytes: usize) -> Self {
        Self {
            framing: Framing::Lines,
            max_frame_bytes,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Read the next frame. `Ok(None)` on a clean end of stream.
    ///
    /// For line framing an oversized line is skipped through its terminator
    /// before `FrameTooLarge` is returned, so the stream stays usable. For
    /// length-prefixed framing the stream is out of sync afterwards and the
    /// connection should be dropped.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>, BridgeError>
    where
        R: AsyncBufRead + Unpin,
    {
        match self.framing {
            Framing::LengthPrefixed => read_prefixed(reader, self.max_frame_bytes).await,
            Framing::Lines => read_line(reader, self.max_frame_bytes).await,
        }
    }

    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        if payload.len() > self.max_frame_bytes {
            return Err(BridgeError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_bytes,
            });
        }

        match self.framing {
            Framing::LengthPrefixed => {
                let len = u32::try_from(payload.len()).map_err(|_| BridgeError::FrameTooLarge {
                    len: payload.len(),
                    max: u32::MAX as usize,
                })?;
                writer.write_all(&len.to_be_bytes()).await?;
                writer.write_all(payload).await?;
            }
            Framing::Lines => {
                writer.write_all(payload).await?;
                writer.write_all(b"\n").await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_json<T, R>(&self, reader: &mut R) -> Result<Option<T>, BridgeError>
    where
        T: DeserializeOwned,
        R: AsyncBufRead + Unpin,
    {
        match self.read_frame(reader).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn write_json<T, W>(&self, writer: &mut W, value: &T) -> Result<(), BridgeError>
    where
        T: Serialize,
        W: AsyncWrite + Unpin,
    {
        let bytes = serde_json::to_vec(value)?;
        self.write_frame(writer, &bytes).await
    }
}

fn eof_as_closed(err: std::io::Error) -> BridgeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        BridgeError::Closed
    } else {
        BridgeError::Io(err)
    }
}

async fn read_prefixed<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    if reader.fill_buf().await?.is_empty() {
        return Ok(None);
    }

    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(BridgeError::FrameTooLarge { len, max });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(eof_as_closed)?;
    Ok(Some(body))
}

async fn read_line<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let read = (&mut *reader)
            .take(max as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        } else if line.len() > max {
            let len = line.len() + skip_line(reader).await?;
            return Err(BridgeError::FrameTooLarge { len, max });
        }

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Some(line));
    }
}

/// Consume through the next `\n`. Returns the number of bytes skipped.
async fn skip_line<R>(reader: &mut R) -> Result<usize, BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let (consume, done) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(skipped);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(consume);
        skipped += consume;
        if done {
            return Ok(skipped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn length_prefixed_frames_in_sequence() {
        let codec = FrameCodec::length_prefixed(1024);
        let mut wire = Vec::new();
        codec.write_json(&mut wire, &json!({"tool": "ping"})).await.unwrap();
        codec.write_frame(&mut wire, b"").await.unwrap();

        assert_eq!(&wire[..4], &(15u32).to_be_bytes());

        let mut reader = wire.as_slice();
        let first: Value = codec.read_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, json!({"tool": "ping"}));
        assert_eq!(codec.read_frame(&mut reader).await.unwrap(), Some(vec![]));
        assert_eq!(codec.read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_body() {
        let codec = FrameCodec::length_prefixed(16);
        let mut wire = 1000u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");

        let mut reader = wire.as_slice();
        let err = codec.read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, BridgeError::FrameTooLarge { len: 1000, max: 16 }));
        // The partial body is still unread.
        assert_eq!(reader, b"abc");
    }

    #[tokio::test]
    async fn truncated_body_is_closed() {
        let codec = FrameCodec::length_prefixed(64);
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"short");

        let mut reader = wire.as_slice();
        let err = codec.read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, BridgeError::Closed));
    }

    #[tokio::test]
    async fn refuses_to_write_oversized_frame() {
        let codec = FrameCodec::length_prefixed(4);
        let mut wire = Vec::new();
        let err = codec.write_frame(&mut wire, b"too long").await.unwrap_err();
        assert!(matches!(err, BridgeError::FrameTooLarge { len: 8, max: 4 }));
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn lines_skip_blanks_and_strip_crlf() {
        let codec = FrameCodec::lines(1024);
        let mut reader: &[u8] = b"\n  \n{\"a\":1}\r\n{\"b\":2}";

        assert_eq!(
            codec.read_frame(&mut reader).await.unwrap().as_deref(),
            Some(&b"{\"a\":1}"[..])
        );
        assert_eq!(
            codec.read_frame(&mut reader).await.unwrap().as_deref(),
            Some(&b"{\"b\":2}"[..])
        );
        assert_eq!(codec.read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped() {
        let codec = FrameCodec::lines(8);
        let mut reader: &[u8] = b"0123456789abcdef\nok\n";

        let err = codec.read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, BridgeError::FrameTooLarge { len: 17, max: 8 }));
        assert_eq!(
            codec.read_frame(&mut reader).await.unwrap().as_deref(),
            Some(&b"ok"[..])
        );
    }

    #[tokio::test]
    async fn line_of_exactly_max_bytes_is_accepted() {
        let codec = FrameCodec::lines(4);
        let mut reader: &[u8] = b"abcd\n";
        assert_eq!(
            codec.read_frame(&mut reader).await.unwrap().as_deref(),
            Some(&b"abcd"[..])
        );
    }
}
