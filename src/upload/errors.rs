use thiserror::Error;
use tokio_tungstenite::tungstenite;
use super::types::{UploadId, UploadStatus};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    /// Non-success HTTP status. `retry_after` is the `Retry-After` header in seconds.
    #[error("{message}")]
    Server {
        status_code: u16,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("Request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(UploadId),

    #[error("Cannot {action} task in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: UploadStatus,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Manager shut down")]
    ManagerShutdown,
}

impl UploadError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<u64>) -> Self {
        Self::Server {
            status_code: 429,
            message: default_status_message(429).to_string(),
            retry_after,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Maps a transport failure from reqwest onto the retry taxonomy.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.status().is_none() && (err.is_connect() || err.is_request()) {
            Self::Connection(err.to_string())
        } else {
            Self::Http(err)
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Server { status_code, .. } => Some(*status_code),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code() == Some(429)
    }

    /// 429, timeouts and requests that never got a response.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server { status_code, .. } => *status_code == 429,
            Self::Timeout | Self::Connection(_) => true,
            Self::Http(err) => match err.status() {
                Some(status) => status.as_u16() == 429,
                None => err.is_timeout() || err.is_connect() || err.is_request(),
            },
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tungstenite::Error> for UploadError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Fallback text for failures whose body carries no message.
pub fn default_status_message(status_code: u16) -> &'static str {
    match status_code {
        400 => "Invalid file. Please check file type and size.",
        401 => "Authentication failed. Please log in again.",
        403 => "Permission denied. You may have exceeded your storage quota.",
        413 => "File too large. Maximum size is 100MB.",
        429 => "Rate limit exceeded. Please try again in a moment.",
        _ => "Upload failed",
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(UploadError::rate_limited(Some(2)).is_retryable());
        assert!(UploadError::Timeout.is_retryable());
        assert!(UploadError::Connection("reset".into()).is_retryable());

        assert!(!UploadError::server_error(400, "bad").is_retryable());
        assert!(!UploadError::server_error(413, "too big").is_retryable());
        assert!(!UploadError::server_error(500, "boom").is_retryable());
        assert!(!UploadError::Cancelled.is_retryable());
        assert!(!UploadError::Validation("nope".into()).is_retryable());
    }

    #[test]
    fn test_rate_limited_carries_header() {
        match UploadError::rate_limited(Some(7)) {
            UploadError::Server { status_code, retry_after, .. } => {
                assert_eq!(status_code, 429);
                assert_eq!(retry_after, Some(7));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
