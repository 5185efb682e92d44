//! Chunk frame encoding and the resumable frame decoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// The zero-length frame that ends a chunked body.
pub const TERMINAL_FRAME: &[u8] = b"0\r\n\r\n";

/// Longest size line accepted, chunk extensions included.
const MAX_SIZE_LINE: usize = 1024;

/// Largest trailer section accepted after the terminal frame.
const MAX_TRAILER: usize = 8 * 1024;

/// 16 hex digits already overflow any sane chunk size.
const MAX_HEX_DIGITS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid chunk size line: {0:?}")]
    InvalidSize(String),

    #[error("chunk of {size} bytes exceeds limit of {limit}")]
    SizeTooLarge { size: u64, limit: usize },

    #[error("chunk declared {declared} bytes but is not followed by CRLF")]
    MissingCrlf { declared: usize },

    #[error("trailer section exceeds {0} bytes")]
    TrailerTooLarge(usize),

    #[error("chunked body ended before the terminal chunk")]
    Truncated,
}

impl From<FrameError> for chunkflow_body::Error {
    fn from(e: FrameError) -> Self {
        chunkflow_body::Error::Frame(e.to_string())
    }
}

/// Append one frame carrying `chunk` to `dst`.
///
/// An empty `chunk` would encode the terminal frame, so it is skipped.
pub fn encode_frame(chunk: &[u8], dst: &mut BytesMut) {
    if chunk.is_empty() {
        return;
    }
    let size = format!("{:x}\r\n", chunk.len());
    dst.reserve(size.len() + chunk.len() + 2);
    dst.put_slice(size.as_bytes());
    dst.put_slice(chunk);
    dst.put_slice(b"\r\n");
}

/// A decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The payload of one complete, validated chunk.
    Data(Bytes),
    /// The terminal frame and trailer section have been consumed.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(usize),
    Trailer { consumed: usize },
    Done,
}

/// Resumable chunked-body decoder.
///
/// Holds no buffer of its own: bytes accumulate in the caller's `BytesMut`
/// and are only split off once a whole frame is present, so a frame split
/// across reads is never surfaced partially.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: State,
    max_chunk_size: usize,
}

impl FrameDecoder {
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            state: State::Size,
            max_chunk_size,
        }
    }

    /// Whether the terminal frame has been decoded.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode the next frame from `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame;
    /// the caller should append more input and call again. After
    /// [`Frame::End`] every call returns `Ok(None)` and leaves `src`
    /// untouched.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line_end) = find_crlf(src) else {
                        if src.len() > MAX_SIZE_LINE {
                            return Err(FrameError::InvalidSize(lossy_prefix(src)));
                        }
                        return Ok(None);
                    };
                    let size = self.parse_size(&src[..line_end])?;
                    src.advance(line_end + 2);
                    self.state = if size == 0 {
                        State::Trailer { consumed: 0 }
                    } else {
                        State::Data(size)
                    };
                }
                State::Data(size) => {
                    let Some(end) = size.checked_add(2) else {
                        return Err(FrameError::SizeTooLarge {
                            size: size as u64,
                            limit: self.max_chunk_size,
                        });
                    };
                    if src.len() < end {
                        return Ok(None);
                    }
                    if &src[size..end] != b"\r\n" {
                        return Err(FrameError::MissingCrlf { declared: size });
                    }
                    let payload = src.split_to(size).freeze();
                    src.advance(2);
                    self.state = State::Size;
                    return Ok(Some(Frame::Data(payload)));
                }
                State::Trailer { consumed } => {
                    let Some(line_end) = find_crlf(src) else {
                        if consumed + src.len() > MAX_TRAILER {
                            return Err(FrameError::TrailerTooLarge(MAX_TRAILER));
                        }
                        return Ok(None);
                    };
                    src.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = State::Done;
                        return Ok(Some(Frame::End));
                    }
                    let consumed = consumed + line_end + 2;
                    if consumed > MAX_TRAILER {
                        return Err(FrameError::TrailerTooLarge(MAX_TRAILER));
                    }
                    self.state = State::Trailer { consumed };
                }
                State::Done => return Ok(None),
            }
        }
    }

    fn parse_size(&self, line: &[u8]) -> Result<usize, FrameError> {
        // Chunk extensions (";name=value") are ignored.
        let digits = match line.iter().position(|&b| b == b';') {
            Some(idx) => &line[..idx],
            None => line,
        };
        let digits = trim_ows(digits);
        if digits.is_empty()
            || digits.len() > MAX_HEX_DIGITS
            || !digits.iter().all(u8::is_ascii_hexdigit)
        {
            return Err(FrameError::InvalidSize(String::from_utf8_lossy(line).into_owned()));
        }
        // All-hex ASCII, so the str conversion cannot fail.
        let text = std::str::from_utf8(digits)
            .map_err(|_| FrameError::InvalidSize(String::from_utf8_lossy(line).into_owned()))?;
        let size = u64::from_str_radix(text, 16)
            .map_err(|_| FrameError::InvalidSize(text.to_string()))?;
        if size > self.max_chunk_size as u64 {
            return Err(FrameError::SizeTooLarge {
                size,
                limit: self.max_chunk_size,
            });
        }
        Ok(size as usize)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn lossy_prefix(buf: &[u8]) -> String {
    String::from_utf8_lossy(&buf[..buf.len().min(32)]).into_owned()
}
