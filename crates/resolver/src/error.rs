//! Status codes surfaced by the engine to query callbacks and callers.

use thiserror::Error;

/// Terminal or retryable status attached to a query.
///
/// Mirrors the taxonomy a c-ares-style engine reports back through its
/// completion callback: most variants are retryable (the dispatcher will try
/// another server/connection before giving up), a handful are fatal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    #[error("success")]
    Success,
    #[error("malformed response")]
    BadResponse,
    #[error("server failure")]
    ServerFailure,
    #[error("not implemented")]
    NotImplemented,
    #[error("refused")]
    Refused,
    #[error("query timed out")]
    Timeout,
    #[error("out of memory")]
    NoMemory,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("address family not supported by server")]
    BadFamily,
    #[error("format error")]
    FormatError,
    #[error("no servers configured")]
    NoServer,
    #[error("query cancelled")]
    Cancelled,
}

impl Status {
    /// Whether this status represents a server-specific retryable failure,
    /// i.e. one that should bump the server's failure counter.
    pub fn is_server_failure(self) -> bool {
        matches!(
            self,
            Status::ServerFailure | Status::NotImplemented | Status::Refused | Status::Timeout
        )
    }
}
