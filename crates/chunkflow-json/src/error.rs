use thiserror::Error;

/// Failure decoding a stream of JSON values.
///
/// Offsets are absolute byte positions in the decoded body.
#[derive(Debug, Error)]
pub enum JsonError {
    #[error("invalid JSON at byte {offset}: {reason}")]
    Parse { offset: u64, reason: String },

    #[error("body ended inside a JSON value at byte {offset}")]
    UnexpectedEof { offset: u64 },

    #[error("JSON value starting at byte {offset} exceeds {limit} bytes")]
    ValueTooLarge { offset: u64, limit: usize },

    #[error("body stream failed: {0}")]
    Body(#[from] chunkflow_body::Error),
}

impl JsonError {
    pub(crate) fn parse(offset: u64, reason: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Byte offset the error refers to, if it came from the decoder.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Parse { offset, .. }
            | Self::UnexpectedEof { offset }
            | Self::ValueTooLarge { offset, .. } => Some(*offset),
            Self::Body(_) => None,
        }
    }
}
