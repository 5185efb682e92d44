use std::time::Duration;

use thiserror::Error;

/// Terminal failure of a body stream.
///
/// Carried as the error variant of every [`ByteStream`](crate::ByteStream)
/// item. An `Err` item always ends the stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("no body data received for {0:?}")]
    Timeout(Duration),

    #[error("malformed chunked framing: {0}")]
    Frame(String),

    #[error("body producer failed: {0}")]
    Producer(String),

    #[error("connection closed before the body was complete")]
    Closed,
}

impl Error {
    /// A failure raised by a body producer (handler stream, generator).
    pub fn producer(message: impl Into<String>) -> Self {
        Self::Producer(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Producer(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Self::Producer(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_from_string_is_producer() {
        let err = Error::from("generator exploded".to_string());
        assert!(matches!(err, Error::Producer(ref m) if m == "generator exploded"));
    }

    #[test]
    fn error_display() {
        let err = Error::producer("tick source closed");
        assert_eq!(format!("{err}"), "body producer failed: tick source closed");

        let err = Error::Timeout(Duration::from_secs(2));
        assert_eq!(format!("{err}"), "no body data received for 2s");
    }

    #[test]
    fn io_errors_convert_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: Error = io.into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!err.is_timeout());
    }

    #[test]
    fn error_is_std_error() {
        let err = Error::producer("test");
        let _: &dyn std::error::Error = &err;
    }
}
