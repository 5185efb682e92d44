//! chunkflow-codec: wire framing for streaming HTTP/1.1 bodies.
//!
//! Converts [`ByteStream`](chunkflow_body::ByteStream) bodies to and from
//! chunked transfer-encoding, and reads/writes the minimal HTTP/1.1
//! message heads that precede them.
//!
//! # Wire Format
//!
//! ```text
//! <hex-length>\r\n<chunk bytes>\r\n      one frame per upstream chunk
//! 0\r\n\r\n                              terminal frame, once, finite bodies only
//! ```
//!
//! Encoding is lazy: a frame is produced only when the upstream chunk is
//! pulled, so an infinite body never produces the terminal frame. Decoding
//! buffers partial frames internally and surfaces only whole, validated
//! payloads.

pub mod chunked;
pub mod frame;
pub mod framing;
pub mod head;

pub use chunked::{WriteError, decode, decode_with_prefix, encode, write_chunked};
pub use frame::{Frame, FrameDecoder, FrameError, TERMINAL_FRAME, encode_frame};
pub use framing::{BodyFraming, ReadBodyError, framed_body, keep_alive, read_body};
pub use head::{
    HeadError, RequestHead, ResponseHead, read_request_head, read_response_head,
    write_request_head, write_response_head,
};
