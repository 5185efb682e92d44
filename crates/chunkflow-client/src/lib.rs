//! Streaming HTTP/1.1 client.
//!
//! [`Client::streaming`] builds one lazy pipeline per request: sign, check
//! out a pooled connection, send, read the response head, then hand the
//! body to a transform as a [`ByteStream`](chunkflow_body::ByteStream).
//! Nothing runs until the returned stream is polled, and the connection is
//! released exactly once however the stream ends.
//!
//! ```no_run
//! use chunkflow_body::Request;
//! use chunkflow_client::Client;
//! use chunkflow_core::ClientConfig;
//! use futures_util::StreamExt;
//!
//! # async fn run() -> Result<(), chunkflow_client::ClientError> {
//! let client = Client::new(ClientConfig::default());
//! let request = Request::get("http://127.0.0.1:8080/events".parse().unwrap());
//! let mut events = client.stream_json::<serde_json::Value>(request).take(10);
//! while let Some(event) = events.next().await {
//!     println!("{}", event?);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod pool;
pub mod signer;

pub use client::{Client, ClientStream};
pub use error::ClientError;
pub use pool::PoolStats;
pub use signer::{BearerSigner, HmacSigner, Signer, SignerError};
