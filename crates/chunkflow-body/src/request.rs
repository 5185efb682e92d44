use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::{Body, ByteStream};

/// An HTTP request whose body is buffered or streaming.
///
/// Server-side requests always carry a buffered body, readable as one
/// buffer via [`body_bytes()`](Request::body_bytes) or as zero-copy chunks
/// via [`body_stream_chunked()`](Request::body_stream_chunked).
/// Client-side requests may carry a streaming body, which is sent with
/// chunked transfer-encoding.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
}

impl Request {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: impl Into<Body>) -> Self {
        Self {
            method,
            uri,
            headers,
            body: body.into(),
        }
    }

    /// Create a request with an empty body.
    pub fn empty(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self::new(method, uri, headers, Body::empty())
    }

    /// A bodiless `GET` request.
    pub fn get(uri: Uri) -> Self {
        Self::empty(Method::GET, uri, HeaderMap::new())
    }

    /// Append a header, builder style.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Direct access to a buffered body; `None` when streaming.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_bytes()
    }

    /// [`body_stream_chunked()`](Request::body_stream_chunked) with
    /// [`DEFAULT_CHUNK_SIZE`](crate::DEFAULT_CHUNK_SIZE) chunks.
    pub fn body_stream(&self) -> Option<ByteStream> {
        self.body.chunks(crate::DEFAULT_CHUNK_SIZE)
    }

    /// A zero-copy view of a buffered body in `chunk_size` pieces.
    ///
    /// Each call creates an independent stream from the same buffer
    /// (an `Arc` refcount increment). Returns `None` for streaming bodies.
    pub fn body_stream_chunked(&self, chunk_size: usize) -> Option<ByteStream> {
        self.body.chunks(chunk_size)
    }

    /// Consume the request into its body stream.
    ///
    /// Buffered bodies are yielded in [`DEFAULT_CHUNK_SIZE`](crate::DEFAULT_CHUNK_SIZE) chunks.
    pub fn into_body_stream(self) -> ByteStream {
        self.body.into_stream()
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    pub fn into_parts(self) -> (Method, Uri, HeaderMap, Body) {
        (self.method, self.uri, self.headers, self.body)
    }
}
