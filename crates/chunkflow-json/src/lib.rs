//! chunkflow-json: incremental decoding of concatenated JSON values.
//!
//! A streaming response body often carries a sequence of JSON values
//! (`{"n":1}{"n":2}...` or NDJSON) that never ends, or ends long after the
//! first value is useful. [`Decoder`] finds value boundaries as chunks
//! arrive, independent of where the transport split them, and
//! [`JsonStream`] turns a [`ByteStream`](chunkflow_body::ByteStream) into a
//! lazy stream of typed values decoded with `serde_json`.
//!
//! ```text
//! chunk 1: {"a":1}{        -> {"a":1}
//! chunk 2: "b":2}          -> {"b":2}
//! end                      -> (nothing pending)
//! ```

mod decoder;
mod error;
mod stream;

pub use decoder::{Decoder, ParserState, RawValue, decode_slice};
pub use error::JsonError;
pub use stream::{JsonStream, decode_stream, encode_values};

pub use chunkflow_core::{DecoderConfig, Separator};
