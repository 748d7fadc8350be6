use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure. Retried with backoff where a retry policy
    /// applies (registration); otherwise surfaced as an event.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed inbound traffic. Logged and discarded, never fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credential challenge exhausted.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Operation not valid for the current call state. Rejected
    /// synchronously to the caller.
    #[error("invalid state: {0}")]
    State(&'static str),

    #[error("destination must not be empty")]
    InvalidDestination,

    /// No final response before the retransmission ceiling elapsed.
    #[error("transaction timeout")]
    TransactionTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rsip::Error> for Error {
    fn from(err: rsip::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}
