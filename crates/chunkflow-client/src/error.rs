use std::io;
use std::time::Duration;

use chunkflow_codec::{HeadError, WriteError};
use chunkflow_json::JsonError;
use http::StatusCode;
use thiserror::Error;

use crate::signer::SignerError;

/// Why a client request or its response stream failed.
///
/// On a [`stream_json`](crate::Client::stream_json) stream every variant is
/// a terminal item, and the connection has been released by the time it is
/// yielded. A custom [`streaming`](crate::Client::streaming) transform that
/// keeps its body past an error holds the connection until the stream is
/// dropped.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request signing failed: {0}")]
    Signer(#[from] SignerError),

    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: io::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("server responded with {0}")]
    Status(StatusCode),

    #[error("invalid response head: {0}")]
    Head(#[from] HeadError),

    #[error("body failed: {0}")]
    Body(#[from] chunkflow_body::Error),

    #[error(transparent)]
    Decode(#[from] JsonError),

    #[error("client has been shut down")]
    Shutdown,

    #[error("invalid request uri: {0}")]
    InvalidUri(String),
}

impl ClientError {
    /// The response status, for [`ClientError::Status`].
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Body(e) => e.is_timeout(),
            Self::Decode(JsonError::Body(e)) => e.is_timeout(),
            _ => false,
        }
    }

    pub(crate) fn send(error: WriteError) -> Self {
        match error {
            WriteError::Body(e) => Self::Body(e),
            WriteError::Io(e) => Self::Body(chunkflow_body::Error::Transport(e)),
            WriteError::Timeout(after) => Self::Timeout {
                operation: "request write",
                after,
            },
        }
    }
}
