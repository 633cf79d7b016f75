use thiserror::Error;

// Infrastructure and management failures. Domain outcomes of a verification
// (revoked, expired, rate limited, ...) are `models::ReasonCode`, not errors.
//
// Clone so one coalesced cache fill can hand the same failure to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Rate limiter backend error: {0}")]
    RateLimiter(String),

    #[error("API key not found")]
    KeyNotFound,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Infrastructure trouble, as opposed to a caller mistake or cancellation.
    pub fn is_internal(&self) -> bool {
        !matches!(
            self,
            ApiError::KeyNotFound | ApiError::InvalidRequest(_) | ApiError::Cancelled
        )
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("background task failed: {}", err))
    }
}
