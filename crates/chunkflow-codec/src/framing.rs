//! How the body after a message head is delimited.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use chunkflow_body::{ByteStream, Error};
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::chunked::decode_with_prefix;
use crate::frame::{Frame, FrameDecoder, FrameError};
use crate::head::HeadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the peer closes the connection.
    Close,
}

impl BodyFraming {
    /// Framing of a request body. Requests without a length are empty.
    pub fn for_request(headers: &HeaderMap) -> Result<Self, HeadError> {
        if is_chunked(headers)? {
            return Ok(Self::Chunked);
        }
        Ok(match content_length(headers)? {
            Some(0) | None => Self::Empty,
            Some(n) => Self::Length(n),
        })
    }

    /// Framing of a response body to a request made with `method`.
    pub fn for_response(
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<Self, HeadError> {
        if method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::Empty);
        }
        if is_chunked(headers)? {
            return Ok(Self::Chunked);
        }
        Ok(match content_length(headers)? {
            Some(0) => Self::Empty,
            Some(n) => Self::Length(n),
            None => Self::Close,
        })
    }

    /// Whether the connection is still usable once this body is consumed.
    pub fn is_delimited(&self) -> bool {
        !matches!(self, Self::Close)
    }
}

/// Whether the sender of `headers` allows the connection to be reused.
pub fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep = false;
    for value in headers.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',').map(str::trim) {
            close |= token.eq_ignore_ascii_case("close");
            keep |= token.eq_ignore_ascii_case("keep-alive");
        }
    }
    if close {
        return false;
    }
    version == Version::HTTP_11 || keep
}

fn is_chunked(headers: &HeaderMap) -> Result<bool, HeadError> {
    let Some(value) = headers.get_all(TRANSFER_ENCODING).iter().last() else {
        return Ok(false);
    };
    let value = value.to_str().map_err(|_| HeadError::InvalidHeader {
        name: "transfer-encoding",
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })?;
    let last = value.rsplit(',').next().unwrap_or("").trim();
    if last.eq_ignore_ascii_case("chunked") {
        Ok(true)
    } else {
        Err(HeadError::InvalidHeader {
            name: "transfer-encoding",
            value: value.to_string(),
        })
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, HeadError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| HeadError::InvalidHeader {
                name: "content-length",
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            })?;
        if length.is_some_and(|prev| prev != parsed) {
            return Err(HeadError::InvalidHeader {
                name: "content-length",
                value: "conflicting values".to_string(),
            });
        }
        length = Some(parsed);
    }
    Ok(length)
}

/// Build the body stream that follows a head.
///
/// `raw` is the connection's read side, `buffered` whatever was read past
/// the head. The raw stream stays owned by the returned body until it is
/// dropped, even after the body ends.
pub fn framed_body(
    framing: BodyFraming,
    raw: ByteStream,
    buffered: BytesMut,
    max_chunk_size: usize,
) -> ByteStream {
    match framing {
        BodyFraming::Chunked => decode_with_prefix(raw, buffered, max_chunk_size),
        BodyFraming::Empty => ByteStream::new(LengthBody::new(raw, buffered, 0)),
        BodyFraming::Length(len) => ByteStream::new(LengthBody::new(raw, buffered, len)),
        BodyFraming::Close => {
            let prefix = futures_util::stream::iter(Some(Ok(buffered.freeze())));
            ByteStream::new(prefix.chain(raw))
        }
    }
}

struct LengthBody {
    raw: ByteStream,
    prefix: Option<Bytes>,
    remaining: u64,
    failed: bool,
}

impl LengthBody {
    fn new(raw: ByteStream, buffered: BytesMut, len: u64) -> Self {
        Self {
            raw,
            prefix: Some(buffered.freeze()),
            remaining: len,
            failed: false,
        }
    }

    fn take(&mut self, mut chunk: Bytes) -> Bytes {
        if chunk.len() as u64 > self.remaining {
            chunk.truncate(self.remaining as usize);
        }
        self.remaining -= chunk.len() as u64;
        chunk
    }
}

impl Stream for LengthBody {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.remaining == 0 || this.failed {
            return Poll::Ready(None);
        }
        if let Some(prefix) = this.prefix.take().filter(|p| !p.is_empty()) {
            return Poll::Ready(Some(Ok(this.take(prefix))));
        }
        match ready!(this.raw.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(this.take(chunk)))),
            Some(Err(e)) => {
                this.failed = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.failed = true;
                Poll::Ready(Some(Err(Error::Closed)))
            }
        }
    }
}

/// Failure reading a whole request body.
#[derive(Debug, Error)]
pub enum ReadBodyError {
    #[error("body exceeds {0} bytes")]
    TooLarge(usize),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection closed before the body was complete")]
    Closed,

    #[error("i/o error reading body: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a complete body of at most `limit` bytes into memory.
///
/// `buf` holds bytes already read past the head and, on return, any bytes
/// past the body (the start of a pipelined next request).
pub async fn read_body<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    framing: BodyFraming,
    limit: usize,
) -> Result<Bytes, ReadBodyError>
where
    R: AsyncRead + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(Bytes::new()),
        BodyFraming::Length(len) => {
            if len > limit as u64 {
                return Err(ReadBodyError::TooLarge(limit));
            }
            let len = len as usize;
            while buf.len() < len {
                if reader.read_buf(buf).await? == 0 {
                    return Err(ReadBodyError::Closed);
                }
            }
            Ok(buf.split_to(len).freeze())
        }
        BodyFraming::Chunked => {
            let mut decoder = FrameDecoder::new(limit);
            let mut body = BytesMut::new();
            loop {
                match decoder.decode(buf)? {
                    Some(Frame::Data(data)) => {
                        if body.len() + data.len() > limit {
                            return Err(ReadBodyError::TooLarge(limit));
                        }
                        body.extend_from_slice(&data);
                    }
                    Some(Frame::End) => return Ok(body.freeze()),
                    None => {
                        if reader.read_buf(buf).await? == 0 {
                            return Err(FrameError::Truncated.into());
                        }
                    }
                }
            }
        }
        BodyFraming::Close => loop {
            if buf.len() > limit {
                return Err(ReadBodyError::TooLarge(limit));
            }
            if reader.read_buf(buf).await? == 0 {
                return Ok(buf.split().freeze());
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn request_framing_from_headers() {
        assert_eq!(BodyFraming::for_request(&headers(&[])).unwrap(), BodyFraming::Empty);
        assert_eq!(
            BodyFraming::for_request(&headers(&[("content-length", "12")])).unwrap(),
            BodyFraming::Length(12)
        );
        assert_eq!(
            BodyFraming::for_request(&headers(&[
                ("content-length", "12"),
                ("transfer-encoding", "chunked"),
            ]))
            .unwrap(),
            BodyFraming::Chunked
        );
    }

    #[test]
    fn response_framing_from_headers() {
        let get = Method::GET;
        assert_eq!(
            BodyFraming::for_response(&get, StatusCode::OK, &headers(&[])).unwrap(),
            BodyFraming::Close
        );
        assert_eq!(
            BodyFraming::for_response(&Method::HEAD, StatusCode::OK, &headers(&[("content-length", "5")]))
                .unwrap(),
            BodyFraming::Empty
        );
        assert_eq!(
            BodyFraming::for_response(&get, StatusCode::NO_CONTENT, &headers(&[])).unwrap(),
            BodyFraming::Empty
        );
    }

    #[test]
    fn unsupported_transfer_encoding_is_rejected() {
        let err = BodyFraming::for_request(&headers(&[("transfer-encoding", "gzip")])).unwrap_err();
        assert!(matches!(err, HeadError::InvalidHeader { name: "transfer-encoding", .. }));
    }

    #[test]
    fn conflicting_content_length_is_rejected() {
        let err = BodyFraming::for_request(&headers(&[
            ("content-length", "3"),
            ("content-length", "4"),
        ]))
        .unwrap_err();
        assert!(matches!(err, HeadError::InvalidHeader { name: "content-length", .. }));
    }

    #[test]
    fn keep_alive_rules() {
        assert!(keep_alive(Version::HTTP_11, &headers(&[])));
        assert!(!keep_alive(Version::HTTP_11, &headers(&[("connection", "close")])));
        assert!(!keep_alive(Version::HTTP_10, &headers(&[])));
        assert!(keep_alive(Version::HTTP_10, &headers(&[("connection", "Keep-Alive")])));
    }

    #[tokio::test]
    async fn length_body_stops_at_declared_length() {
        let raw = ByteStream::from_chunks(["lo wor", "ld", "NEXT"]);
        let body = framed_body(BodyFraming::Length(11), raw, BytesMut::from(&b"hel"[..]), 1024);
        assert_eq!(body.collect().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn length_body_early_eof_is_closed() {
        let raw = ByteStream::from_chunks(["abc"]);
        let err = framed_body(BodyFraming::Length(10), raw, BytesMut::new(), 1024)
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn close_delimited_body_reads_to_eof() {
        let raw = ByteStream::from_chunks(["b", "c"]);
        let body = framed_body(BodyFraming::Close, raw, BytesMut::from(&b"a"[..]), 1024);
        assert_eq!(body.collect().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn empty_body_keeps_raw_stream_until_dropped() {
        let (tx, rx) = std::sync::mpsc::channel();
        let raw = ByteStream::from_chunks(["unused"]).on_finalize_case(move |exit| tx.send(exit).unwrap());
        let mut body = framed_body(BodyFraming::Empty, raw, BytesMut::new(), 1024);

        assert!(body.next().await.is_none());
        assert!(rx.try_recv().is_err());
        drop(body);
        assert_eq!(rx.try_recv().unwrap(), chunkflow_body::Exit::Cancelled);
    }

    #[tokio::test]
    async fn read_body_content_length_keeps_pipelined_bytes() {
        let mut input: &[u8] = b"loGET / HTTP/1.1\r\n";
        let mut buf = BytesMut::from(&b"hel"[..]);
        let body = read_body(&mut input, &mut buf, BodyFraming::Length(5), 1024)
            .await
            .unwrap();
        assert_eq!(body, "hello");
        assert_eq!(&buf[..], b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn read_body_chunked() {
        let mut input: &[u8] = b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let mut buf = BytesMut::new();
        let body = read_body(&mut input, &mut buf, BodyFraming::Chunked, 1024)
            .await
            .unwrap();
        assert_eq!(body, "abcde");
    }

    #[tokio::test]
    async fn read_body_enforces_limit() {
        let mut input: &[u8] = b"";
        let mut buf = BytesMut::new();
        let err = read_body(&mut input, &mut buf, BodyFraming::Length(2048), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadBodyError::TooLarge(1024)));

        let mut input: &[u8] = b"4\r\nabcd\r\n4\r\nefgh\r\n0\r\n\r\n";
        let err = read_body(&mut input, &mut buf, BodyFraming::Chunked, 6)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadBodyError::TooLarge(6)));
    }

    #[tokio::test]
    async fn read_body_truncated_chunked_input() {
        let mut input: &[u8] = b"4\r\nab";
        let mut buf = BytesMut::new();
        let err = read_body(&mut input, &mut buf, BodyFraming::Chunked, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadBodyError::Frame(FrameError::Truncated)));
    }
}
