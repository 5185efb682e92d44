//! Streaming HTTP/1.1 server.
//!
//! Handlers are registered on a [`Routes`] table by exact method and path
//! and return a [`Response`](chunkflow_body::Response). Buffered bodies are
//! sent with `Content-Length`; streaming bodies are pulled one chunk at a
//! time and written with chunked transfer-encoding, so an endless stream
//! keeps flowing until the client goes away.
//!
//! ```no_run
//! use chunkflow_body::{ByteStream, Response};
//! use chunkflow_core::ServerConfig;
//! use chunkflow_server::{Routes, Server};
//! use http::{HeaderMap, StatusCode};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let routes = Routes::new().get("/hello", |_req| async {
//!     let body = ByteStream::from_chunks(["hello, ", "world"]);
//!     Ok(Response::streaming(StatusCode::OK, HeaderMap::new(), body))
//! });
//! let server = Server::new(ServerConfig::default(), routes);
//! let listener = server.bind().await?;
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! server.serve(listener, shutdown).await
//! # }
//! ```

mod connection;
mod routes;
mod server;

pub use routes::{BoxFuture, Handler, Resolved, Routes};
pub use server::Server;
