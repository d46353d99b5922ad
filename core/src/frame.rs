//! Length-prefixed wire framing.
//!
//! Every message on the wire is
//!
//! ```text
//! <decimal-length>\n<command>\n<payload-bytes>
//! ```
//!
//! where `<decimal-length>` is the byte length of everything after the first
//! newline (command, separator, and payload). The command is an ASCII token;
//! the payload is opaque bytes and may itself contain newlines.
//!
//! Malformed input is fatal: a non-numeric or over-long length header, or a
//! declared length above the frame cap, produces a decode error and the
//! connection is torn down rather than resynchronized.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single frame body (command + separator + payload).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest accepted length header, excluding its terminating newline.
pub const MAX_HEADER_LEN: usize = 32;

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The command token naming the frame kind (e.g. `EXEC_OUT`).
    pub command: String,
    /// Opaque payload bytes after the command separator.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Payload rendered as text for logging and header parsing.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Codec for the decimal-ASCII length-prefixed format.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        let Some(header_end) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > MAX_HEADER_LEN {
                return Err(invalid(format!(
                    "length header exceeds {MAX_HEADER_LEN} bytes without newline"
                )));
            }
            return Ok(None);
        };

        let header = &src[..header_end];
        if header.is_empty() || header.len() > MAX_HEADER_LEN {
            return Err(invalid("empty or over-long length header"));
        }
        let len = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| invalid("non-numeric length header"))?;

        if len > self.max_frame_size {
            return Err(invalid(format!(
                "declared frame length {len} exceeds cap {}",
                self.max_frame_size
            )));
        }

        let frame_end = header_end + 1 + len;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(header_end + 1);
        let body = src.split_to(len).freeze();

        // The body is `command\npayload`; a body without a newline is all
        // command with an empty payload.
        let (command, payload) = match body.iter().position(|&b| b == b'\n') {
            Some(sep) => (body.slice(..sep), body.slice(sep + 1..)),
            None => (body.clone(), Bytes::new()),
        };
        let command = String::from_utf8_lossy(&command)
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();

        Ok(Some(Frame { command, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        if item.command.is_empty() || item.command.bytes().any(|b| b == b'\n') {
            return Err(invalid("command must be a non-empty token without newlines"));
        }

        let body_len = item.command.len() + 1 + item.payload.len();
        if body_len > self.max_frame_size {
            return Err(invalid(format!(
                "frame body {body_len} bytes exceeds cap {}",
                self.max_frame_size
            )));
        }

        let header = format!("{body_len}\n");
        dst.reserve(header.len() + body_len);
        dst.put_slice(header.as_bytes());
        dst.put_slice(item.command.as_bytes());
        dst.put_u8(b'\n');
        dst.put_slice(&item.payload);
        Ok(())
    }
}
