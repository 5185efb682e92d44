//! Chunkflow message bodies as lazily produced byte streams.
//!
//! Provides [`ByteStream`], the transport-level body representation, and the
//! [`Request`] / [`Response`] types that carry it. Bodies are either
//! pre-buffered or streaming; both can be consumed through the same
//! pull-based `ByteStream` interface.
//!
//! # Streaming Model
//!
//! A `ByteStream` is a `futures_core::Stream` of non-empty `Bytes` chunks.
//! Nothing is produced until the consumer polls: socket reads, handler
//! generators and transforms all run one chunk at a time, on demand.
//! Streams may be infinite (periodic event sources) or finite.
//!
//! Combinators ([`ByteStream::map_chunks`], [`ByteStream::through`]) wrap
//! one stream inside another without evaluating anything.
//!
//! # Finalizers
//!
//! [`ByteStream::on_finalize`] registers a cleanup action that runs exactly
//! once, when the stream completes, fails, or is dropped early. Finalizers
//! run before the upstream producer is released, so a connection-owning
//! producer can observe how its body ended.

pub(crate) mod body;
mod error;
mod request;
mod response;
mod stream;

pub use body::{Body, DEFAULT_CHUNK_SIZE};
pub use error::Error;
pub use request::Request;
pub use response::Response;
pub use stream::{BoxByteStream, ByteStream, Exit};
