use std::time::Duration;

use thiserror::Error;

/// An error that happens while producing a resource.
///
/// The error is delivered to every claim waiting for the resource, so it is cheap to clone and
/// carries details as strings instead of source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProduceError {
    /// The resource does not exist.
    #[error("not found")]
    NotFound,
    /// The resource could not be produced due to missing permissions.
    ///
    /// The attached string contains the remote response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Producing the resource took too long.
    #[error("production timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to connection loss, DNS resolution, a 5xx server
    /// response or similar problems.
    #[error("download failed: {0}")]
    Download(String),
    /// The resource was produced, but is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Production was cancelled before it finished.
    #[error("production cancelled")]
    Cancelled,
    /// The requested key could not be mapped to a key the producer understands.
    #[error("unresolved key: {0}")]
    UnresolvedKey(String),
    /// A failure reported by a custom producer.
    #[error("{0}")]
    Other(String),
    /// An unexpected error in the avenue or the producer itself.
    #[error("internal error")]
    InternalError,
}

impl ProduceError {
    /// Creates a [`ProduceError::Other`] from anything printable.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Logs an unexpected error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, static name of the error kind, for use in metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::Download(_) => "download",
            Self::Malformed(_) => "malformed",
            Self::Cancelled => "cancelled",
            Self::UnresolvedKey(_) => "unresolved",
            Self::Other(_) => "other",
            Self::InternalError => "internal",
        }
    }
}

impl From<std::io::Error> for ProduceError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}
