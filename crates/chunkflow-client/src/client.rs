use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use chunkflow_body::{Body, ByteStream, Exit, Request, Response};
use chunkflow_codec::{
    BodyFraming, RequestHead, framed_body, keep_alive, read_response_head, write_chunked,
    write_request_head,
};
use chunkflow_core::{ClientConfig, DecoderConfig};
use chunkflow_json::{JsonError, decode_slice, decode_stream};
use futures_core::Stream;
use futures_util::TryStreamExt;
use http::header::{CONTENT_LENGTH, HOST, HeaderValue, TRANSFER_ENCODING, USER_AGENT};
use http::{Method, Uri};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ClientError;
use crate::pool::{Pool, PoolConfig, PoolStats};
use crate::signer::Signer;

/// A lazily evaluated sequence of values from one response.
pub type ClientStream<T> = Pin<Box<dyn Stream<Item = Result<T, ClientError>> + Send>>;

/// HTTP/1.1 client whose responses are consumed as streams.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    decoder: DecoderConfig,
    pool: Pool,
    signer: Option<Arc<dyn Signer>>,
    runtime: Option<Handle>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let pool = Pool::new(PoolConfig::from(&config));
        Self {
            config: Arc::new(config),
            decoder: DecoderConfig::default(),
            pool,
            signer: None,
            runtime: None,
        }
    }

    /// Sign every request with `signer` before it is sent.
    pub fn with_signer(mut self, signer: impl Signer + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Run request exchanges on `handle` instead of the polling task.
    ///
    /// Dropping a request before its response head arrives aborts the
    /// spawned exchange.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Limits used by [`stream_json`](Self::stream_json) and [`json`](Self::json).
    pub fn with_decoder(mut self, decoder: DecoderConfig) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close idle connections and fail every later request with
    /// [`ClientError::Shutdown`].
    ///
    /// Streams already in flight keep their connections until they end.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Send `request` and return the response as soon as its head arrives.
    ///
    /// The body is left unread: it streams from the connection as it is
    /// polled. The connection goes back to the pool only if the body is read
    /// to its end; dropping it early closes the connection.
    pub async fn fetch(&self, request: Request) -> Result<Response, ClientError> {
        let Some(handle) = &self.runtime else {
            return self.exchange(request).await;
        };
        let client = self.clone();
        let mut task = AbortOnDrop(handle.spawn(async move { client.exchange(request).await }));
        match (&mut task.0).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(ClientError::Shutdown),
        }
    }

    /// Stream the response body of `request` through `transform`.
    ///
    /// Nothing happens until the returned stream is first polled. Signing,
    /// connecting and sending then run once; values are yielded as the
    /// transform produces them. A non-2xx status fails the stream with
    /// [`ClientError::Status`].
    pub fn streaming<T, F, S, E>(&self, request: Request, transform: F) -> ClientStream<T>
    where
        F: FnOnce(ByteStream) -> S + Send + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<ClientError>,
        T: Send + 'static,
    {
        let client = self.clone();
        let response = async move {
            let response = client.fetch(request).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::Status(status));
            }
            Ok(transform(response.into_body_stream()).map_err(Into::into))
        };
        Box::pin(futures_util::stream::once(response).try_flatten())
    }

    /// Decode the response body as a stream of concatenated JSON values.
    pub fn stream_json<T>(&self, request: Request) -> ClientStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let decoder = self.decoder.clone();
        self.streaming(request, move |body| decode_stream::<T>(body, &decoder))
    }

    /// Read the whole response body and decode exactly one JSON value.
    pub async fn json<T: DeserializeOwned>(&self, request: Request) -> Result<T, ClientError> {
        let response = self.fetch(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status));
        }
        let bytes = response.into_bytes().await?;
        let mut values = decode_slice::<T>(&bytes, &self.decoder)?;
        if values.len() != 1 {
            return Err(JsonError::Parse {
                offset: bytes.len() as u64,
                reason: format!("expected exactly one JSON value, found {}", values.len()),
            }
            .into());
        }
        Ok(values.remove(0))
    }

    async fn exchange(&self, request: Request) -> Result<Response, ClientError> {
        if self.pool.is_closed() {
            return Err(ClientError::Shutdown);
        }
        let request = match &self.signer {
            Some(signer) => signer.sign(request).await?,
            None => request,
        };
        let (method, uri, mut headers, body) = request.into_parts();
        let authority = authority_of(&uri)?;

        if !headers.contains_key(HOST) {
            let host = uri.authority().map(|a| a.as_str()).unwrap_or_default();
            let host = HeaderValue::from_str(host).map_err(|e| ClientError::InvalidUri(e.to_string()))?;
            headers.insert(HOST, host);
        }
        if !headers.contains_key(USER_AGENT) {
            if let Ok(agent) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(USER_AGENT, agent);
            }
        }
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        match &body {
            Body::Buffered(bytes) if bytes.is_empty() && !sends_body(&method) => {}
            Body::Buffered(bytes) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
            Body::Streaming(_) => {
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
        }

        let mut conn = self.pool.checkout(&authority).await?;
        debug!(%authority, %method, path = uri.path(), "sending request");

        let write_timeout = self.config.write_timeout();
        let head = RequestHead::new(method.clone(), uri, headers);
        timed("request write", write_timeout, write_request_head(&mut conn, &head))
            .await?
            .map_err(transport)?;
        match body {
            Body::Buffered(bytes) => {
                timed("request write", write_timeout, async {
                    conn.write_all(&bytes).await?;
                    conn.flush().await
                })
                .await?
                .map_err(transport)?;
            }
            Body::Streaming(stream) => {
                write_chunked(stream, &mut conn, write_timeout)
                    .await
                    .map_err(ClientError::send)?;
            }
        }

        let read_timeout = self.config.read_timeout();
        let mut buf = BytesMut::with_capacity(self.config.read_size);
        let head = timed(
            "response head",
            read_timeout,
            read_response_head(&mut conn, &mut buf, self.config.max_head_size),
        )
        .await??;

        let framing = BodyFraming::for_response(&method, head.status, &head.headers)?;
        let reusable = framing.is_delimited() && keep_alive(head.version, &head.headers);
        debug!(%authority, status = %head.status, ?framing, "response head received");

        let reuse = conn.reuse_flag();
        let raw = ByteStream::from_reader(conn, self.config.read_size, read_timeout);
        let body = framed_body(framing, raw, buf, self.config.max_chunk_size).on_finalize_case(
            move |exit| {
                if exit == Exit::Completed && reusable {
                    reuse.store(true, Ordering::Release);
                }
                debug!(%authority, ?exit, "response body finished");
            },
        );
        Ok(Response::streaming(head.status, head.headers, body))
    }
}

/// Aborts a spawned exchange, and with it its checkout, if the caller stops
/// waiting for the response head.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// `host:port` to connect to for `uri`.
fn authority_of(uri: &Uri) -> Result<String, ClientError> {
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(ClientError::InvalidUri(format!("unsupported scheme {other:?} in {uri}")));
        }
        None => return Err(ClientError::InvalidUri(format!("{uri} is not an absolute http uri"))),
    }
    let authority = uri
        .authority()
        .ok_or_else(|| ClientError::InvalidUri(format!("{uri} has no host")))?;
    Ok(format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80)))
}

fn sends_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn transport(e: io::Error) -> ClientError {
    ClientError::Body(chunkflow_body::Error::Transport(e))
}

async fn timed<F: Future>(
    operation: &'static str,
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, ClientError> {
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| ClientError::Timeout { operation, after }),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_defaults_port_80() {
        let uri: Uri = "http://example.com/events".parse().unwrap();
        assert_eq!(authority_of(&uri).unwrap(), "example.com:80");
        let uri: Uri = "http://127.0.0.1:9000/".parse().unwrap();
        assert_eq!(authority_of(&uri).unwrap(), "127.0.0.1:9000");
    }

    #[test]
    fn authority_rejects_relative_and_tls_uris() {
        for uri in ["/events", "https://example.com/"] {
            let uri: Uri = uri.parse().unwrap();
            assert!(matches!(authority_of(&uri), Err(ClientError::InvalidUri(_))));
        }
    }

    #[tokio::test]
    async fn nothing_happens_until_polled() {
        use futures_util::StreamExt;

        let client = Client::new(ClientConfig::default());
        // Port 9 on loopback: nothing listens, so a connect would fail.
        let stream = client.stream_json::<serde_json::Value>(Request::get(
            "http://127.0.0.1:9/events".parse().unwrap(),
        ));
        assert_eq!(client.stats().checkouts, 0);

        let mut stream = stream;
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(ClientError::Connect { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn signer_failure_aborts_before_connecting() {
        use crate::signer::SignerError;
        use futures_util::StreamExt;

        let client = Client::new(ClientConfig::default()).with_signer(|_req: Request| async {
            Err::<Request, _>(SignerError::Credentials("token expired".into()))
        });
        let mut stream = client.stream_json::<serde_json::Value>(Request::get(
            "http://127.0.0.1:9/events".parse().unwrap(),
        ));
        assert!(matches!(stream.next().await, Some(Err(ClientError::Signer(_)))));
        assert_eq!(client.stats().checkouts, 0);
    }

    #[tokio::test]
    async fn shut_down_client_refuses_requests() {
        let client = Client::new(ClientConfig::default());
        client.shutdown();
        client.shutdown();
        let err = client
            .fetch(Request::get("http://127.0.0.1:9/".parse().unwrap()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Shutdown));
    }
}
