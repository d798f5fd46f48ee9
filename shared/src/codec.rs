//! Stream framing for the relay protocol
//!
//! The relay speaks one of two interchangeable framings, selected at
//! deployment time:
//! - **Text**: frames are terminated by `\n`
//! - **Binary**: frames start with a 2-byte big-endian length that counts the
//!   whole frame, prefix included
//!
//! Both codecs buffer partial frames across reads, so a frame may arrive split
//! at any byte boundary. They implement the `tokio_util` codec traits and are
//! used through `FramedRead`/`FramedWrite` on both ends of a connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::warn;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single text frame, delimiter excluded
pub const DEFAULT_MAX_FRAME_LEN: usize = 65_535;

const LENGTH_PREFIX_LEN: usize = 2;

/// Largest payload a length-prefixed frame can carry
pub const MAX_BINARY_PAYLOAD_LEN: usize = u16::MAX as usize - LENGTH_PREFIX_LEN;

/// Transport-level framing failures
///
/// Any of these ends the connection: once framing is lost the stream cannot
/// be resynchronised. `FrameTooLong` only arises when encoding; overlong
/// inbound text lines are skipped instead.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
    #[error("length prefix {0} is shorter than the prefix itself")]
    InvalidLengthPrefix(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wire framing selected for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Text,
    Binary,
}

#[derive(Debug, Error)]
#[error("unknown framing `{0}` (expected `text` or `binary`)")]
pub struct UnknownFraming(String);

impl FromStr for Framing {
    type Err = UnknownFraming;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "newline" => Ok(Framing::Text),
            "binary" | "length-prefixed" => Ok(Framing::Binary),
            _ => Err(UnknownFraming(s.to_string())),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Text => f.write_str("text"),
            Framing::Binary => f.write_str("binary"),
        }
    }
}

/// Newline-delimited frames
///
/// A line longer than the limit is skipped up to its terminating `\n` and the
/// stream carries on with the next line.
#[derive(Debug, Clone)]
pub struct TextCodec {
    max_frame_len: usize,
    /// Bytes already scanned for a delimiter without finding one
    next_index: usize,
    /// Inside an overlong line whose start was already thrown away
    discarding: bool,
}

impl TextCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TextCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            let scanned = self.next_index.min(src.len());
            let Some(offset) = src[scanned..].iter().position(|b| *b == b'\n') else {
                if self.discarding {
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max_frame_len {
                    warn!(
                        "Discarding text frame longer than {} bytes",
                        self.max_frame_len
                    );
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let newline = scanned + offset;
            self.next_index = 0;
            if self.discarding {
                src.advance(newline + 1);
                self.discarding = false;
                continue;
            }
            if newline > self.max_frame_len {
                warn!(
                    "Discarding text frame of {} bytes (limit {})",
                    newline, self.max_frame_len
                );
                src.advance(newline + 1);
                continue;
            }

            let mut frame = src.split_to(newline + 1);
            frame.truncate(newline);
            return Ok(Some(frame.freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // An unterminated tail is not a frame.
                src.clear();
                self.next_index = 0;
                self.discarding = false;
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for TextCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Frames prefixed with a 2-byte big-endian total length
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedCodec;

impl Decoder for LengthPrefixedCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([src[0], src[1]]);
        let total = declared as usize;
        if total < LENGTH_PREFIX_LEN {
            return Err(FrameError::InvalidLengthPrefix(declared));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(LENGTH_PREFIX_LEN);
        Ok(Some(frame.freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for LengthPrefixedCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > MAX_BINARY_PAYLOAD_LEN {
            return Err(FrameError::FrameTooLong {
                len: payload.len(),
                max: MAX_BINARY_PAYLOAD_LEN,
            });
        }

        let total = (payload.len() + LENGTH_PREFIX_LEN) as u16;
        dst.reserve(total as usize);
        dst.put_u16(total);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Codec for whichever framing the deployment selected
#[derive(Debug, Clone)]
pub enum FrameCodec {
    Text(TextCodec),
    Binary(LengthPrefixedCodec),
}

impl FrameCodec {
    /// `max_frame_len` only bounds text frames; binary frames are bounded by
    /// their 16-bit prefix.
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        match framing {
            Framing::Text => FrameCodec::Text(TextCodec::with_max_frame_len(max_frame_len)),
            Framing::Binary => FrameCodec::Binary(LengthPrefixedCodec),
        }
    }

}

impl From<Framing> for FrameCodec {
    fn from(framing: Framing) -> Self {
        FrameCodec::new(framing, DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self {
            FrameCodec::Text(codec) => codec.decode(src),
            FrameCodec::Binary(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self {
            FrameCodec::Text(codec) => codec.decode_eof(src),
            FrameCodec::Binary(codec) => codec.decode_eof(src),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            FrameCodec::Text(codec) => codec.encode(payload, dst),
            FrameCodec::Binary(codec) => codec.encode(payload, dst),
        }
    }
}
