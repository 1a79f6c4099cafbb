use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification used by callers to decide how to react:
/// retry, re-authenticate, upgrade, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection-level or server-side failure; safe to retry.
    Transport,
    /// Missing or rejected credentials.
    Auth,
    /// Server speaks an incompatible API version.
    Version,
    /// Malformed payload from the server.
    Parse,
    /// Local filesystem trouble.
    Local,
    /// Engine state prevents the operation.
    State,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("server returned {status} for {url}: {message}")]
    Server {
        status: u16,
        url: String,
        message: String,
    },

    #[error("no credentials configured")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server API version '{server}' is older than the supported {expected}")]
    VersionIncompatible { server: String, expected: String },

    #[error("malformed server payload: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sync already running for project '{0}'")]
    SyncInProgress(String),

    #[error("unknown project '{0}'")]
    UnknownProject(String),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Transport(_) | SyncError::Server { .. } => ErrorCategory::Transport,
            SyncError::AuthRequired | SyncError::Auth(_) => ErrorCategory::Auth,
            SyncError::VersionIncompatible { .. } => ErrorCategory::Version,
            SyncError::Parse(_) | SyncError::Json(_) => ErrorCategory::Parse,
            SyncError::Io(_) => ErrorCategory::Local,
            SyncError::SyncInProgress(_) | SyncError::UnknownProject(_) => ErrorCategory::State,
            SyncError::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether a chunk exchange may be re-attempted after this error.
    /// Client errors (4xx) are not retried; the request would fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
