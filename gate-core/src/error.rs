use std::fmt::{self, Display, Formatter};

/// Errors produced anywhere in the diff/sync engine, the persistent index,
/// or the scheduler. Session-scoped callers map these onto the taxonomy in
/// the wire protocol (`{ok: false}`), background tasks just log them.
#[derive(Debug)]
pub enum Error {
    /// Wraps a filesystem or network I/O failure.
    Io(std::io::Error),

    /// A bucket store transaction could not be committed.
    IndexIO(String),

    /// The configured broker client reported a failure (offset lookup,
    /// consume, or produce).
    Broker(String),

    /// Session header token did not match the configured server token.
    Auth(String),

    /// The requested topic is not on the allow-list.
    PolicyDenied(String),

    /// A frame could not be decoded, or named an unknown format.
    Protocol(String),

    /// A session's cancel signal fired.
    Cancelled,

    /// Anything else: invariant violations, bad config, encoding failures.
    Internal(String),
}

pub type CResult<T> = Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::IndexIO(msg) => write!(f, "index store error: {msg}"),
            Error::Broker(msg) => write!(f, "broker error: {msg}"),
            Error::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Error::PolicyDenied(msg) => write!(f, "topic denied: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = vec![
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")),
            Error::IndexIO("x".into()),
            Error::Broker("x".into()),
            Error::Auth("x".into()),
            Error::PolicyDenied("x".into()),
            Error::Protocol("x".into()),
            Error::Cancelled,
            Error::Internal("x".into()),
        ];
        for v in variants {
            assert!(!v.to_string().is_empty());
        }
    }
}
