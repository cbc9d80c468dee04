//! # Network Transport
//!
//! Async wrappers that move whole text frames over a byte stream.
//!
//! - [`framer`] - pure, incremental varint length-prefix decoder/encoder
//! - [`FrameReader`] - pulls complete frames out of any [`AsyncRead`]
//! - [`FrameWriter`] - writes length-prefixed frames to any [`AsyncWrite`]
//!
//! Both halves are generic so sessions run over split `TcpStream` halves while tests can
//! drive them with in-memory mocks.

pub mod framer;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use framer::{encode_frame, FrameError, TextFramer};

const READ_CHUNK: usize = 1024;

pub struct FrameReader<R> {
    inner: R,
    framer: TextFramer,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame: usize) -> Self {
        Self {
            inner,
            framer: TextFramer::new(max_frame),
        }
    }

    /// Read the next frame as text. Invalid UTF-8 is replaced rather than rejected.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream; a partially received frame
    /// at that point is discarded. Cancel safe: bytes are only consumed from the socket
    /// by the single `read` await and are buffered before any frame is returned.
    pub async fn read_frame(&mut self) -> Result<Option<String>, FrameError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.framer.next_frame()? {
                return Ok(Some(String::from_utf8_lossy(&frame).into_owned()));
            }
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.framer.pending() > 0 {
                    log::debug!(
                        "peer closed with {} unframed bytes pending",
                        self.framer.pending()
                    );
                }
                return Ok(None);
            }
            self.framer.push(&chunk[..n]);
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
    max_frame: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame: usize) -> Self {
        Self { inner, max_frame }
    }

    /// Write one frame. Text longer than `max_frame` bytes is cut at the last char
    /// boundary that fits, so a peer enforcing the same limit never sees an oversize frame.
    pub async fn write_frame(&mut self, text: &str) -> std::io::Result<()> {
        let payload = truncate_utf8(text, self.max_frame);
        if payload.len() < text.len() {
            log::warn!(
                "outgoing frame of {} bytes truncated to {}",
                text.len(),
                payload.len()
            );
        }
        self.inner.write_all(&encode_frame(payload.as_bytes())).await?;
        self.inner.flush().await
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_frames_across_socket_reads() {
        let encoded = encode_frame(b"alice eng");
        let mock = tokio_test::io::Builder::new()
            .read(&encoded[..3])
            .read(&encoded[3..])
            .read(&encode_frame(b"groups"))
            .build();
        let mut reader = FrameReader::new(mock, 1024);
        assert_eq!(reader.read_frame().await.unwrap().as_deref(), Some("alice eng"));
        assert_eq!(reader.read_frame().await.unwrap().as_deref(), Some("groups"));
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_at_eof_reads_as_closed() {
        let encoded = encode_frame(b"post hi there");
        let mock = tokio_test::io::Builder::new().read(&encoded[..5]).build();
        let mut reader = FrameReader::new(mock, 1024);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_frame_is_an_error() {
        let big = "y".repeat(64);
        let mock = tokio_test::io::Builder::new()
            .read(&encode_frame(big.as_bytes()))
            .build();
        let mut reader = FrameReader::new(mock, 16);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn writer_emits_length_prefixed_frames() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode_frame(b"id 0"))
            .build();
        let mut writer = FrameWriter::new(mock, 1024);
        writer.write_frame("id 0").await.unwrap();
    }

    #[tokio::test]
    async fn writer_cuts_oversize_text_on_a_char_boundary() {
        // "é" is two bytes; a 7 byte limit falls inside the third one.
        let mock = tokio_test::io::Builder::new()
            .write(&encode_frame("abéé".as_bytes()))
            .build();
        let mut writer = FrameWriter::new(mock, 7);
        writer.write_frame("abéééé").await.unwrap();

        assert_eq!(truncate_utf8("hello", 5), "hello");
        assert_eq!(truncate_utf8("hello", 2), "he");
        assert_eq!(truncate_utf8("éé", 3), "é");
    }
}
