//! Varint length‑delimited text framer for the client protocol.
//!
//! Every frame on the wire, in both directions, is emitted as:
//!
//!   `<varint length><utf-8 payload>`
//!
//! The length is an unsigned LEB128 varint counting payload bytes. This module provides a
//! small incremental framer that can be fed arbitrary socket chunks and yields whole
//! frames when available. Unlike a device serial link there is nothing to resynchronize
//! against on a TCP stream, so malformed or oversize prefixes are reported as errors and
//! the connection is dropped by the caller.
use bytes::{Buf, BytesMut};

/// Longest varint accepted: 5 bytes covers every `u32` length.
const MAX_VARINT_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("malformed length prefix")]
    MalformedLength,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental decoder holding bytes received but not yet framed.
pub struct TextFramer {
    buf: BytesMut,
    max_frame: usize,
}

impl TextFramer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Attempt to extract the next complete frame payload. Returns `Ok(None)` when more
    /// bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut len: usize = 0;
        let mut varint_len = 0usize;
        let mut terminated = false;
        for (i, b) in self.buf.iter().take(MAX_VARINT_LEN).enumerate() {
            len |= ((b & 0x7F) as usize) << (7 * i);
            varint_len += 1;
            if b & 0x80 == 0 {
                terminated = true;
                break;
            }
        }
        if !terminated {
            if varint_len == MAX_VARINT_LEN {
                return Err(FrameError::MalformedLength);
            }
            return Ok(None);
        }
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame,
            });
        }
        if self.buf.len() < varint_len + len {
            return Ok(None);
        }

        self.buf.advance(varint_len);
        let frame = self.buf.split_to(len).to_vec();
        Ok(Some(frame))
    }
}

/// Prefix `payload` with its varint length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + MAX_VARINT_LEN);
    let mut len = payload.len();
    loop {
        let byte = (len & 0x7F) as u8;
        len >>= 7;
        if len == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out.extend_from_slice(payload);
    out
}
