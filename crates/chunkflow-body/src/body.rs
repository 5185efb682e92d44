//! Body representation and minimal stream helpers.
//!
//! Provides [`Body`], plus the [`ChunkedBytesStream`] adapter that yields a
//! `Bytes` buffer in fixed-size chunks without copying (via
//! `Bytes::slice()`) and the small adapters behind the [`ByteStream`]
//! constructors.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_core::Stream;

use crate::{ByteStream, Error};

/// Default chunk size for breaking buffered bodies into stream chunks (64 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A message body: either fully buffered or produced incrementally.
pub enum Body {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl Body {
    pub fn empty() -> Self {
        Self::Buffered(Bytes::new())
    }

    /// Exact body length when it is known without consuming the body.
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            Self::Buffered(bytes) => Some(bytes.len() as u64),
            Self::Streaming(_) => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// The buffered bytes, or `None` for a streaming body.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes),
            Self::Streaming(_) => None,
        }
    }

    /// A zero-copy chunked view of a buffered body.
    ///
    /// Each call creates an independent stream over the same allocation.
    /// Returns `None` for a streaming body, which can only be consumed once.
    pub fn chunks(&self, chunk_size: usize) -> Option<ByteStream> {
        self.as_bytes()
            .map(|bytes| ByteStream::chunked(bytes.clone(), chunk_size))
    }

    /// Consume the body as a stream of chunks.
    ///
    /// Buffered bodies are yielded in [`DEFAULT_CHUNK_SIZE`] pieces.
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Buffered(bytes) if bytes.is_empty() => ByteStream::empty(),
            Self::Buffered(bytes) => ByteStream::chunked(bytes, DEFAULT_CHUNK_SIZE),
            Self::Streaming(stream) => stream,
        }
    }

    /// Consume the body and collect it into a single buffer.
    pub async fn collect(self) -> Result<Bytes, Error> {
        match self {
            Self::Buffered(bytes) => Ok(bytes),
            Self::Streaming(stream) => stream.collect().await,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Streaming(stream) => f.debug_tuple("Streaming").field(stream).finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Buffered(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffered(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Buffered(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Buffered(Bytes::from_static(s.as_bytes()))
    }
}

impl From<ByteStream> for Body {
    fn from(stream: ByteStream) -> Self {
        Self::Streaming(stream)
    }
}

/// Yields a `Bytes` buffer in fixed-size chunks without copying.
///
/// Uses `Bytes::slice()` for zero-copy sub-slicing backed by the same
/// reference-counted allocation; only the current chunk is yielded.
pub(crate) struct ChunkedBytesStream {
    buf: Bytes,
    chunk_size: usize,
    offset: usize,
}

impl ChunkedBytesStream {
    pub fn new(buf: Bytes, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        Self {
            buf,
            chunk_size,
            offset: 0,
        }
    }
}

impl Stream for ChunkedBytesStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.offset >= this.buf.len() {
            return Poll::Ready(None);
        }
        let end = std::cmp::min(this.offset + this.chunk_size, this.buf.len());
        let chunk = this.buf.slice(this.offset..end);
        this.offset = end;
        Poll::Ready(Some(Ok(chunk)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.buf.len() - self.offset).div_ceil(self.chunk_size);
        (remaining, Some(remaining))
    }
}

// ── Minimal stream helpers ──────────────────────────────────────────

/// A stream that yields at most one `Bytes` value then ends.
pub(crate) struct OnceStream(pub Option<Bytes>);

impl Stream for OnceStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().0.take().map(Ok))
    }
}

/// Lifts an infallible chunk stream into a fallible one.
pub(crate) struct FromInfallible<S> {
    inner: Pin<Box<S>>,
}

impl<S> FromInfallible<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<S: Stream<Item = Bytes>> Stream for FromInfallible<S> {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let chunk = ready!(self.get_mut().inner.as_mut().poll_next(cx));
        Poll::Ready(chunk.map(Ok))
    }
}

/// Applies `f` to each chunk as it is pulled.
pub(crate) struct MapChunks<F> {
    inner: ByteStream,
    f: F,
}

impl<F> MapChunks<F> {
    pub fn new(inner: ByteStream, f: F) -> Self {
        Self { inner, f }
    }
}

impl<F: FnMut(Bytes) -> Bytes + Unpin> Stream for MapChunks<F> {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        Poll::Ready(item.map(|chunk| chunk.map(&mut this.f)))
    }
}
