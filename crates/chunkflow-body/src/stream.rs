use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Error;
use crate::body::{ChunkedBytesStream, FromInfallible, MapChunks, OnceStream};

/// A type-erased, fallible stream of byte chunks.
pub type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

type Finalizer = Box<dyn FnOnce(Exit) + Send>;

/// How a [`ByteStream`] ended, as reported to its finalizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The producer signalled end of stream.
    Completed,
    /// The producer yielded an error.
    Failed,
    /// The stream was dropped before reaching a terminal item.
    Cancelled,
}

/// A lazily produced, possibly infinite sequence of non-empty byte chunks.
///
/// The consumer drives evaluation: each `poll_next` pulls at most one chunk
/// from the producer. Empty chunks from the producer are skipped so the
/// concatenation of yielded chunks is the logical content.
///
/// After a terminal item (`None` or an `Err`) the stream is fused, its
/// finalizers have run and the producer has been dropped.
pub struct ByteStream {
    inner: Option<BoxByteStream>,
    finalizers: Vec<Finalizer>,
}

impl ByteStream {
    /// Wrap any fallible chunk stream.
    pub fn new(stream: impl Stream<Item = Result<Bytes, Error>> + Send + 'static) -> Self {
        Self {
            inner: Some(Box::pin(stream)),
            finalizers: Vec::new(),
        }
    }

    /// Wrap an infallible chunk stream (e.g. a handler's generator).
    pub fn from_infallible(stream: impl Stream<Item = Bytes> + Send + 'static) -> Self {
        Self::new(FromInfallible::new(stream))
    }

    /// A stream that ends immediately.
    pub fn empty() -> Self {
        Self::new(OnceStream(None))
    }

    /// A stream yielding `bytes` as a single chunk.
    pub fn once(bytes: impl Into<Bytes>) -> Self {
        Self::new(OnceStream(Some(bytes.into())))
    }

    /// Yield a buffer in `chunk_size` pieces without copying.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn chunked(bytes: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self::new(ChunkedBytesStream::new(bytes.into(), chunk_size))
    }

    /// A finite stream over already-materialised chunks.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
        I::IntoIter: Send + 'static,
    {
        let iter = chunks.into_iter();
        Self::new(futures_util::stream::iter(iter.map(|c| Ok(c.into()))))
    }

    /// Read from `reader` on demand, up to `read_size` bytes per chunk.
    ///
    /// Nothing is read until the stream is polled. EOF ends the stream; an
    /// I/O error or `idle_timeout` elapsing without data fails it. The
    /// reader is dropped as soon as the stream reaches a terminal item.
    pub fn from_reader<R>(reader: R, read_size: usize, idle_timeout: Option<Duration>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        assert!(read_size > 0, "read_size must be > 0");
        let stream = futures_util::stream::unfold(Some(reader), move |state| async move {
            let mut reader = state?;
            let mut buf = BytesMut::with_capacity(read_size);
            let read = match idle_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, reader.read_buf(&mut buf)).await {
                        Ok(read) => read,
                        Err(_) => return Some((Err(Error::Timeout(limit)), None)),
                    }
                }
                None => reader.read_buf(&mut buf).await,
            };
            match read {
                Ok(0) => None,
                Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
                Err(e) => Some((Err(Error::Transport(e)), None)),
            }
        });
        Self::new(stream)
    }

    /// Lazily transform each chunk.
    pub fn map_chunks<F>(self, f: F) -> Self
    where
        F: FnMut(Bytes) -> Bytes + Send + Unpin + 'static,
    {
        Self::new(MapChunks::new(self, f))
    }

    /// Compose with a stream-to-stream transform (codec, rate limiter, ...).
    ///
    /// The transform receives this stream unevaluated; it only wraps it.
    pub fn through<F>(self, transform: F) -> Self
    where
        F: FnOnce(ByteStream) -> ByteStream,
    {
        transform(self)
    }

    /// Register `action` to run exactly once when the stream ends, fails,
    /// or is dropped.
    pub fn on_finalize<F>(self, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_finalize_case(move |_| action())
    }

    /// Like [`on_finalize`](Self::on_finalize), but the action learns how
    /// the stream ended.
    ///
    /// Finalizers run in reverse registration order. Registering on a
    /// stream that already terminated runs the action when the stream is
    /// dropped, with [`Exit::Cancelled`].
    pub fn on_finalize_case<F>(mut self, action: F) -> Self
    where
        F: FnOnce(Exit) + Send + 'static,
    {
        self.finalizers.push(Box::new(action));
        self
    }

    /// Whether the stream has reached a terminal item.
    pub fn is_terminated(&self) -> bool {
        self.inner.is_none()
    }

    /// Drain the stream into a single buffer.
    pub async fn collect(mut self) -> Result<Bytes, Error> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = std::future::poll_fn(|cx| Pin::new(&mut self).poll_next(cx)).await
        {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }

    fn terminate(&mut self, exit: Exit) {
        self.run_finalizers(exit);
        self.inner = None;
    }

    fn run_finalizers(&mut self, exit: Exit) {
        while let Some(finalizer) = self.finalizers.pop() {
            finalizer(exit);
        }
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                Some(Err(e)) => {
                    this.terminate(Exit::Failed);
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.terminate(Exit::Completed);
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Some(inner) => (0, inner.size_hint().1),
            None => (0, Some(0)),
        }
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        // Finalizers see the producer still alive; it is released with the
        // `inner` field afterwards.
        self.run_finalizers(Exit::Cancelled);
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("terminated", &self.inner.is_none())
            .field("finalizers", &self.finalizers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn poll_all(mut stream: ByteStream) -> Vec<Result<Bytes, Error>> {
        let mut items = Vec::new();
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        loop {
            match Pin::new(&mut stream).poll_next(&mut cx) {
                Poll::Ready(Some(item)) => items.push(item),
                Poll::Ready(None) => break,
                Poll::Pending => panic!("in-memory stream should never pend"),
            }
        }
        items
    }

    fn exits() -> (Arc<Mutex<Vec<Exit>>>, impl FnOnce(Exit) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |exit| sink.lock().unwrap().push(exit))
    }

    #[test]
    fn finalizer_runs_once_on_completion() {
        let (seen, record) = exits();
        let stream = ByteStream::from_chunks(["a", "b"]).on_finalize_case(record);

        let items = poll_all(stream);
        assert_eq!(items.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![Exit::Completed]);
    }

    #[test]
    fn finalizer_runs_once_on_failure() {
        let (seen, record) = exits();
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from("a")),
            Err(Error::producer("boom")),
            Ok(Bytes::from("never")),
        ]);
        let stream = ByteStream::new(upstream).on_finalize_case(record);

        let items = poll_all(stream);
        assert_eq!(items.len(), 2, "stream must be fused after the error");
        assert!(items[1].is_err());
        assert_eq!(*seen.lock().unwrap(), vec![Exit::Failed]);
    }

    #[test]
    fn finalizer_runs_once_on_cancel() {
        let (seen, record) = exits();
        let mut stream = ByteStream::from_chunks(["a", "b", "c"]).on_finalize_case(record);

        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(matches!(
            Pin::new(&mut stream).poll_next(&mut cx),
            Poll::Ready(Some(Ok(_)))
        ));
        drop(stream);

        assert_eq!(*seen.lock().unwrap(), vec![Exit::Cancelled]);
    }

    #[test]
    fn finalizers_run_in_reverse_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let stream = ByteStream::once("x")
            .on_finalize(move || first.lock().unwrap().push("first"))
            .on_finalize(move || second.lock().unwrap().push("second"));

        poll_all(stream);
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn finalizer_sees_producer_still_alive() {
        // The producer's drop flag must still be clear when the finalizer runs.
        struct Producer(Arc<AtomicUsize>);
        impl Drop for Producer {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let guard = Producer(dropped.clone());
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let observed_in = observed.clone();
        let dropped_in = dropped.clone();

        let upstream = futures_util::stream::iter(vec![Ok::<_, Error>(Bytes::from("a"))]);
        let stream = ByteStream::new(futures_util::StreamExt::map(upstream, move |item| {
            let _keep = &guard;
            item
        }))
        .on_finalize(move || observed_in.store(dropped_in.load(Ordering::SeqCst), Ordering::SeqCst));

        poll_all(stream);
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_chunks_are_skipped() {
        let stream = ByteStream::from_chunks(["", "a", "", "b", ""]);
        let chunks: Vec<Bytes> = poll_all(stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[test]
    fn map_chunks_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stream = ByteStream::from_chunks(["ab", "cd"]).map_chunks(move |c| {
            counter.fetch_add(1, Ordering::SeqCst);
            Bytes::from(c.to_ascii_uppercase())
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let chunks: Vec<Bytes> = poll_all(stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec![Bytes::from("AB"), Bytes::from("CD")]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn through_composes_transforms() {
        let stream = ByteStream::from_chunks(["abc"])
            .through(|s| s.map_chunks(|c| Bytes::from(c.to_ascii_uppercase())))
            .through(|s| s.map_chunks(|c| Bytes::from(c.iter().rev().copied().collect::<Vec<_>>())));

        let chunks: Vec<Bytes> = poll_all(stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec![Bytes::from("CBA")]);
    }

    #[tokio::test]
    async fn from_reader_reads_on_demand() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut stream = ByteStream::from_reader(rx, 16, None);

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"hello").await.unwrap();
        let chunk = futures_util::StreamExt::next(&mut stream).await.unwrap().unwrap();
        assert_eq!(chunk, "hello");

        drop(tx);
        assert!(futures_util::StreamExt::next(&mut stream).await.is_none());
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn from_reader_idle_timeout_fails_stream() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut stream = ByteStream::from_reader(rx, 16, Some(Duration::from_millis(20)));

        let err = futures_util::StreamExt::next(&mut stream).await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(futures_util::StreamExt::next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn collect_concatenates() {
        let body = ByteStream::chunked(Bytes::from_static(b"0123456789"), 3)
            .collect()
            .await
            .unwrap();
        assert_eq!(body, "0123456789");
    }
}
