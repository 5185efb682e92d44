use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::{Body, ByteStream, Error};

/// An HTTP response with support for streaming bodies.
///
/// Use [`Response::new()`] for small, known-size responses; the server
/// sends them with `Content-Length`.
///
/// Use [`Response::streaming()`] for large, slow or unbounded output. The
/// body is pulled chunk by chunk while the response is written and is sent
/// with `Transfer-Encoding: chunked`; it is never buffered as a whole.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    /// Create a response with a pre-buffered body.
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: Body::Buffered(body.into()),
        }
    }

    /// Create a response with an empty body.
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    /// Create a response whose body is produced lazily by `stream`.
    pub fn streaming(status: StatusCode, headers: HeaderMap, stream: ByteStream) -> Self {
        Self {
            status,
            headers,
            body: Body::Streaming(stream),
        }
    }

    /// Encode a single value as an `application/json` response.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(value)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self::new(status, headers, body))
    }

    pub(crate) fn from_parts(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
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

    /// Returns `true` if the body is streaming (not pre-buffered).
    pub fn is_streaming(&self) -> bool {
        self.body.is_streaming()
    }

    /// Consume the response and collect the body into a single buffer.
    pub async fn into_bytes(self) -> Result<Bytes, Error> {
        self.body.collect().await
    }

    /// Consume the response into a stream of byte chunks.
    pub fn into_body_stream(self) -> ByteStream {
        self.body.into_stream()
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Body) {
        (self.status, self.headers, self.body)
    }
}

impl From<(StatusCode, HeaderMap, Body)> for Response {
    fn from((status, headers, body): (StatusCode, HeaderMap, Body)) -> Self {
        Self::from_parts(status, headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn buffered_response_into_bytes() {
        let resp = Response::new(StatusCode::OK, HeaderMap::new(), "hello world");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.is_streaming());
        assert_eq!(resp.body().size_hint(), Some(11));

        let body = resp.into_bytes().await.unwrap();
        assert_eq!(body.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn streaming_response_basic() {
        let stream = ByteStream::from_chunks(["hello ", "world"]);
        let resp = Response::streaming(StatusCode::OK, HeaderMap::new(), stream);
        assert!(resp.is_streaming());
        assert_eq!(resp.body().size_hint(), None);

        let body = resp.into_bytes().await.unwrap();
        assert_eq!(body.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn streaming_response_surfaces_producer_error() {
        let stream = ByteStream::new(futures_util::stream::iter(vec![
            Ok(Bytes::from("partial")),
            Err(Error::producer("sensor offline")),
        ]));
        let resp = Response::streaming(StatusCode::OK, HeaderMap::new(), stream);
        let err = resp.into_bytes().await.unwrap_err();
        assert!(matches!(err, Error::Producer(_)));
    }

    #[tokio::test]
    async fn buffered_response_into_body_stream() {
        let resp = Response::new(StatusCode::OK, HeaderMap::new(), "test");
        let mut stream = resp.into_body_stream();

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("test"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_response_streams_nothing() {
        let mut stream = Response::empty(StatusCode::NO_CONTENT).into_body_stream();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn json_response_sets_content_type() {
        let resp = Response::json(StatusCode::CREATED, &serde_json::json!({"id": 1})).unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(resp.body().as_bytes().unwrap().as_ref(), br#"{"id":1}"#);
    }
}
