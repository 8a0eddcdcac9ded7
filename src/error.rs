//! Error types for the strand engine

use thiserror::Error;

/// Engine error
#[derive(Debug, Error)]
pub enum StrandError {
    /// Every backend failed or returned no extractable answer
    #[error("Not resolvable: {0}")]
    NotResolvable(String),

    /// The head fragment of a state chain could not be fetched or parsed
    #[error("Head fragment unreadable: {address}: {reason}")]
    HeadUnreadable { address: String, reason: String },

    /// A removal would flatten a state whose chain was only partly read
    #[error("State below head {0} is incomplete")]
    IncompleteState(String),

    /// Upload or name-publish step failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Backend answered 429
    #[error("Rate limited by {0}")]
    RateLimited(String),

    /// A candidate or call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Backend answered with a non-success status
    #[error("Gateway error {status} from {url}")]
    Gateway { status: u16, url: String },

    /// Backend answered successfully but nothing usable could be extracted
    #[error("No extractable answer from {0}")]
    NoAnswer(String),

    /// The backoff governor refused the attempt
    #[error("Backing off: {0}")]
    BackedOff(String),

    /// Operation was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Identifier could not be parsed
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A write was attempted with no local daemon configured
    #[error("No local daemon configured")]
    NoLocalDaemon,

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sled::Error> for StrandError {
    fn from(e: sled::Error) -> Self {
        StrandError::Store(e.to_string())
    }
}

impl StrandError {
    /// Whether a low-level transport retry may help.
    ///
    /// 5xx, 429, timeouts and connection failures are transient; 4xx and
    /// everything above the transport layer are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StrandError::RateLimited(_) | StrandError::Timeout(_) => true,
            StrandError::Gateway { status, .. } => *status >= 500,
            StrandError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether the failure should put the backend origin into cooldown
    pub fn is_backend_overload(&self) -> bool {
        match self {
            StrandError::RateLimited(_) => true,
            StrandError::Gateway { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, StrandError>;
