//! Wire framing for Agent Protocol streams.
//!
//! The gateway writes one JSON value per line terminated by `\n`. On the
//! inbound path the decoder auto-detects the framing by peeking at the first
//! byte of the stream: `{` or `[` selects newline framing; anything else
//! selects LSP-style `Content-Length` header framing, which some JSON-RPC
//! children use. Detection happens once per stream.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum frame length accepted by the codec: 1 MiB.
///
/// Frames exceeding this limit cause [`FrameCodec::decode`] to return
/// [`AppError::Protocol`] rather than allocating unbounded memory for a
/// single message from a misbehaving child.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Detected framing mode for an inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramingMode {
    /// One JSON value per `\n`-terminated line.
    Newline,
    /// `Content-Length: N\r\n\r\n<N bytes>` header framing.
    Header,
}

/// Auto-detecting frame codec for bidirectional agent streams.
///
/// The encoder always produces newline framing. The decoder picks its mode
/// from the first byte it sees and keeps it for the life of the stream.
#[derive(Debug)]
pub struct FrameCodec {
    mode: Option<FramingMode>,
    lines: LinesCodec,
}

impl FrameCodec {
    /// Create a codec with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: None,
            lines: LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        }
    }

    /// Decode one header-framed message, buffering until complete.
    fn decode_header_frame(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let Some(header_end) = find_subsequence(src, b"\r\n\r\n") else {
            if src.len() > MAX_FRAME_BYTES {
                return Err(AppError::Protocol(
                    "header block exceeded maximum frame size".into(),
                ));
            }
            return Ok(None);
        };

        let content_length = parse_content_length(&src[..header_end])?;
        if content_length > MAX_FRAME_BYTES {
            return Err(AppError::Protocol(format!(
                "frame too long: {content_length} bytes exceeds {MAX_FRAME_BYTES}"
            )));
        }

        let body_start = header_end + 4;
        if src.len() < body_start + content_length {
            return Ok(None);
        }

        src.advance(body_start);
        let body = src.split_to(content_length);
        let text = String::from_utf8(body.to_vec())
            .map_err(|e| AppError::Protocol(format!("frame is not valid utf-8: {e}")))?;
        Ok(Some(text))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.mode.is_none() {
            let Some(&first) = src.first() else {
                return Ok(None);
            };
            self.mode = Some(if first == b'{' || first == b'[' {
                FramingMode::Newline
            } else {
                FramingMode::Header
            });
        }

        match self.mode {
            Some(FramingMode::Newline) => self.lines.decode(src).map_err(map_line_error),
            Some(FramingMode::Header) => self.decode_header_frame(src),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.mode {
            Some(FramingMode::Header) => self.decode_header_frame(src),
            _ => self.lines.decode_eof(src).map_err(map_line_error),
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated line into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] on underlying I/O failures.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.lines.encode(item, dst).map_err(map_line_error)
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Map a [`LinesCodecError`] to an [`AppError`].
fn map_line_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("line too long: exceeded {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

/// Extract the `Content-Length` value from a header block.
fn parse_content_length(headers: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(headers)
        .map_err(|e| AppError::Protocol(format!("header block is not valid utf-8: {e}")))?;

    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<usize>().map_err(|e| {
                    AppError::Protocol(format!("invalid Content-Length value: {e}"))
                });
            }
        }
    }

    Err(AppError::Protocol(
        "missing Content-Length header in framed message".into(),
    ))
}

/// Index of the first occurrence of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
