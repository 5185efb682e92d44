//! Lazy chunked transfer-encoding over [`ByteStream`] bodies.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chunkflow_body::{ByteStream, Error};
use futures_core::Stream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::frame::{Frame, FrameDecoder, FrameError, TERMINAL_FRAME, encode_frame};

/// Frame every upstream chunk as it is pulled.
///
/// The terminal frame is emitted once, after the upstream ends cleanly. An
/// upstream error is forwarded in its place, so a peer decoding the output
/// sees a truncated body rather than a complete one.
pub fn encode(body: ByteStream) -> ByteStream {
    ByteStream::new(ChunkedEncoder {
        upstream: body,
        finished: false,
    })
}

struct ChunkedEncoder {
    upstream: ByteStream,
    finished: bool,
}

impl Stream for ChunkedEncoder {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.upstream.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => {
                let mut framed = BytesMut::new();
                encode_frame(&chunk, &mut framed);
                Poll::Ready(Some(Ok(framed.freeze())))
            }
            Some(Err(e)) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                self.finished = true;
                Poll::Ready(Some(Ok(Bytes::from_static(TERMINAL_FRAME))))
            }
        }
    }
}

/// Failure while writing a chunked body to a peer.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The body producer failed; nothing after the last whole frame was sent.
    #[error("body stream failed: {0}")]
    Body(#[source] Error),

    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    #[error("write stalled for {0:?}")]
    Timeout(Duration),
}

impl WriteError {
    /// Whether the peer went away (as opposed to the producer failing).
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}

/// Write `body` to `writer` as a chunked body, one frame at a time.
///
/// Each frame is written and flushed before the next chunk is pulled, so a
/// slow reader throttles the producer and at most one framed chunk is held
/// in memory. Returns the number of wire bytes written.
pub async fn write_chunked<W>(
    body: ByteStream,
    writer: &mut W,
    write_timeout: Option<Duration>,
) -> Result<u64, WriteError>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = encode(body);
    let mut written = 0u64;
    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(WriteError::Body)?;
        write_frame(writer, &frame, write_timeout).await?;
        written += frame.len() as u64;
    }
    Ok(written)
}

async fn write_frame<W>(writer: &mut W, frame: &[u8], limit: Option<Duration>) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin,
{
    let io = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    match limit {
        Some(limit) => tokio::time::timeout(limit, io)
            .await
            .map_err(|_| WriteError::Timeout(limit))??,
        None => io.await?,
    }
    Ok(())
}

/// Reconstitute the payload of a chunked body from raw wire bytes.
pub fn decode(raw: ByteStream, max_chunk_size: usize) -> ByteStream {
    decode_with_prefix(raw, BytesMut::new(), max_chunk_size)
}

/// Like [`decode`], for input whose first bytes were already read into
/// `buffered` (typically while reading the message head).
///
/// The raw stream is held until the returned stream is dropped, so
/// finalizers registered on the returned stream run while the underlying
/// connection is still owned.
pub fn decode_with_prefix(raw: ByteStream, buffered: BytesMut, max_chunk_size: usize) -> ByteStream {
    ByteStream::new(ChunkedDecoder {
        raw,
        buf: buffered,
        frames: FrameDecoder::new(max_chunk_size),
        finished: false,
    })
}

struct ChunkedDecoder {
    raw: ByteStream,
    buf: BytesMut,
    frames: FrameDecoder,
    finished: bool,
}

impl Stream for ChunkedDecoder {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            match this.frames.decode(&mut this.buf) {
                Ok(Some(Frame::Data(payload))) => return Poll::Ready(Some(Ok(payload))),
                Ok(Some(Frame::End)) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Err(e) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Ok(None) => {}
            }
            match ready!(this.raw.poll_next_unpin(cx)) {
                Some(Ok(bytes)) => this.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(FrameError::Truncated.into())));
                }
            }
        }
    }
}
