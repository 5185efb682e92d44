//! One HTTP/1.1 connection: read requests, dispatch, write responses.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chunkflow_body::{Body, Response};
use chunkflow_codec::{
    BodyFraming, HeadError, ReadBodyError, ResponseHead, WriteError, keep_alive, read_body,
    read_request_head, write_chunked, write_response_head,
};
use chunkflow_core::ServerConfig;
use http::header::{CONNECTION, CONTENT_LENGTH, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::Routes;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectionError {
    #[error("bad request head: {0}")]
    Head(#[from] HeadError),

    #[error("bad request body: {0}")]
    Body(#[from] ReadBodyError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub(crate) struct Connection<S> {
    io: S,
    peer_addr: SocketAddr,
    routes: Arc<Routes>,
    config: Arc<ServerConfig>,
    buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: S, peer_addr: SocketAddr, routes: Arc<Routes>, config: Arc<ServerConfig>) -> Self {
        Self {
            io,
            peer_addr,
            routes,
            config,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Serve requests until either side ends the connection.
    pub(crate) async fn run(mut self) -> Result<(), ConnectionError> {
        loop {
            if !self.serve_one().await? {
                return Ok(());
            }
        }
    }

    /// Serve a single request; returns whether the connection stays open.
    async fn serve_one(&mut self) -> Result<bool, ConnectionError> {
        let peer_addr = self.peer_addr;
        let head_timeout = self.config.header_read_timeout();
        let read = read_request_head(&mut self.io, &mut self.buf, self.config.max_head_size);
        let head = match tokio::time::timeout(head_timeout, read).await {
            Err(_) => {
                debug!(%peer_addr, timeout = ?head_timeout, "no request head received, closing");
                return Ok(false);
            }
            Ok(Ok(None)) => return Ok(false),
            Ok(Ok(Some(head))) => head,
            Ok(Err(HeadError::TooLarge(limit))) => {
                self.reject(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE).await?;
                return Err(HeadError::TooLarge(limit).into());
            }
            Ok(Err(e @ HeadError::Io(_))) => return Err(e.into()),
            Ok(Err(e)) => {
                self.reject(StatusCode::BAD_REQUEST).await?;
                return Err(e.into());
            }
        };

        let framing = match BodyFraming::for_request(&head.headers) {
            Ok(framing) => framing,
            Err(e) => {
                self.reject(StatusCode::BAD_REQUEST).await?;
                return Err(e.into());
            }
        };
        let limit = self.config.max_request_body;
        let body = match read_body(&mut self.io, &mut self.buf, framing, limit).await {
            Ok(body) => body,
            Err(e @ ReadBodyError::TooLarge(_)) => {
                self.reject(StatusCode::PAYLOAD_TOO_LARGE).await?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let reuse = self.config.keep_alive && keep_alive(head.version, &head.headers);
        let method = head.method.clone();
        debug!(%peer_addr, %method, path = head.uri.path(), "request");

        let request = chunkflow_body::Request::new(head.method, head.uri, head.headers, body);
        let response = match self.routes.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(%peer_addr, error = %e, "request handler failed");
                Response::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HeaderMap::new(),
                    "Internal Server Error",
                )
            }
        };
        self.write_response(&method, response, reuse).await
    }

    async fn write_response(
        &mut self,
        method: &Method,
        response: Response,
        reuse: bool,
    ) -> Result<bool, ConnectionError> {
        let peer_addr = self.peer_addr;
        let write_timeout = self.config.write_timeout();
        let (status, mut headers, body) = response.into_parts();
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONTENT_LENGTH);
        if !reuse {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        let bodiless = *method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        match body {
            Body::Buffered(bytes) => {
                if status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                }
                let head = ResponseHead::new(status, headers);
                with_timeout(write_timeout, write_response_head(&mut self.io, &head)).await?;
                if !bodiless && !bytes.is_empty() {
                    with_timeout(write_timeout, async {
                        self.io.write_all(&bytes).await?;
                        self.io.flush().await
                    })
                    .await?;
                }
                Ok(reuse)
            }
            Body::Streaming(stream) if bodiless => {
                drop(stream);
                let head = ResponseHead::new(status, headers);
                with_timeout(write_timeout, write_response_head(&mut self.io, &head)).await?;
                Ok(reuse)
            }
            Body::Streaming(stream) => {
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                let head = ResponseHead::new(status, headers);
                with_timeout(write_timeout, write_response_head(&mut self.io, &head)).await?;

                match write_chunked(stream, &mut self.io, write_timeout).await {
                    Ok(written) => {
                        debug!(%peer_addr, bytes = written, "streamed response complete");
                        Ok(reuse)
                    }
                    Err(WriteError::Body(e)) => {
                        // No terminal frame was written, so the peer sees a
                        // truncated body; the connection cannot be reused.
                        warn!(%peer_addr, error = %e, "response stream failed, truncating");
                        Ok(false)
                    }
                    Err(e) => {
                        debug!(%peer_addr, error = %e, "peer stopped reading streamed response");
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Answer a request that could not be read, then close.
    async fn reject(&mut self, status: StatusCode) -> Result<(), ConnectionError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        let head = ResponseHead::new(status, headers);
        let write_timeout = self.config.write_timeout();
        with_timeout(write_timeout, write_response_head(&mut self.io, &head)).await?;
        Ok(())
    }
}

async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?,
        None => fut.await,
    }
}
