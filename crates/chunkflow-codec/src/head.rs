//! Minimal HTTP/1.1 message heads.
//!
//! Only what a streaming body needs: the request line or status line, and
//! the header block. Heads are read into the caller's buffer until the
//! blank line; bytes that arrived after it stay in the buffer as the start
//! of the body.

use std::io;

use bytes::{BufMut, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("i/o error reading message head: {0}")]
    Io(#[from] io::Error),

    #[error("message head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("connection closed in the middle of a message head")]
    Incomplete,

    #[error("malformed start line: {0:?}")]
    StartLine(String),

    #[error("unsupported protocol version: {0:?}")]
    Version(String),

    #[error("malformed header line: {0:?}")]
    Header(String),

    #[error("invalid {name} header: {value:?}")]
    InvalidHeader { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers,
        }
    }

    /// Parse a complete head, blank line included.
    pub fn parse(raw: &[u8]) -> Result<Self, HeadError> {
        let (start, headers) = split_head(raw)?;
        let mut parts = start.split(' ').filter(|p| !p.is_empty());
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HeadError::StartLine(start.to_string()));
        };
        let method =
            Method::from_bytes(method.as_bytes()).map_err(|_| HeadError::StartLine(start.to_string()))?;
        let uri = target
            .parse::<Uri>()
            .map_err(|_| HeadError::StartLine(start.to_string()))?;
        Ok(Self {
            method,
            uri,
            version: parse_version(version)?,
            headers,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let target = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        dst.put_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(target.as_bytes());
        dst.put_slice(b" HTTP/1.1\r\n");
        encode_headers(&self.headers, dst);
    }
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, HeadError> {
        let (start, headers) = split_head(raw)?;
        let mut parts = start.splitn(3, ' ');
        let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
            return Err(HeadError::StartLine(start.to_string()));
        };
        let status = StatusCode::from_bytes(code.as_bytes())
            .map_err(|_| HeadError::StartLine(start.to_string()))?;
        Ok(Self {
            status,
            version: parse_version(version)?,
            headers,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(b"HTTP/1.1 ");
        dst.put_slice(self.status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.canonical_reason().unwrap_or("").as_bytes());
        dst.put_slice(b"\r\n");
        encode_headers(&self.headers, dst);
    }
}

/// Read a request head from `reader`.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly before
/// sending anything, which is how an idle keep-alive connection ends.
pub async fn read_request_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<RequestHead>, HeadError>
where
    R: AsyncRead + Unpin,
{
    match read_head(reader, buf, max_size).await? {
        Some(raw) => RequestHead::parse(&raw).map(Some),
        None => Ok(None),
    }
}

pub async fn read_response_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<ResponseHead, HeadError>
where
    R: AsyncRead + Unpin,
{
    match read_head(reader, buf, max_size).await? {
        Some(raw) => ResponseHead::parse(&raw),
        None => Err(HeadError::Incomplete),
    }
}

pub async fn write_request_head<W>(writer: &mut W, head: &RequestHead) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut dst = BytesMut::with_capacity(256);
    head.encode(&mut dst);
    writer.write_all(&dst).await
}

/// Write and flush a response head, so a streaming body's first chunk is
/// not needed to get the status to the peer.
pub async fn write_response_head<W>(writer: &mut W, head: &ResponseHead) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut dst = BytesMut::with_capacity(256);
    head.encode(&mut dst);
    writer.write_all(&dst).await?;
    writer.flush().await
}

async fn read_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<BytesMut>, HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut scanned = 0;
    loop {
        if let Some(pos) = find_blank_line(&buf[scanned..]) {
            return Ok(Some(buf.split_to(scanned + pos + 4)));
        }
        if buf.len() > max_size {
            return Err(HeadError::TooLarge(max_size));
        }
        scanned = buf.len().saturating_sub(3);
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HeadError::Incomplete);
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_head(raw: &[u8]) -> Result<(&str, HeaderMap), HeadError> {
    let raw = raw.strip_suffix(b"\r\n\r\n").unwrap_or(raw);
    let mut lines = raw.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let start = lines.next().unwrap_or_default();
    let start = std::str::from_utf8(start)
        .map_err(|_| HeadError::StartLine(String::from_utf8_lossy(start).into_owned()))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(HeadError::Header(String::from_utf8_lossy(line).into_owned()));
        };
        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|_| HeadError::Header(String::from_utf8_lossy(line).into_owned()))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|_| HeadError::Header(String::from_utf8_lossy(line).into_owned()))?;
        headers.append(name, value);
    }
    Ok((start, headers))
}

fn parse_version(version: &str) -> Result<Version, HeadError> {
    match version {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(HeadError::Version(other.to_string())),
    }
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}
