use thiserror::Error;

pub type Result<T> = std::result::Result<T, PineconeError>;

#[derive(Debug, Error)]
pub enum PineconeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl PineconeError {
    /// Connection failures, timeouts, throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            PineconeError::Network(_) | PineconeError::Timeout(_) => true,
            PineconeError::Api { status, .. } => *status == 429 || *status >= 500,
            PineconeError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for PineconeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PineconeError::Timeout(err.to_string())
        } else {
            PineconeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PineconeError {
    fn from(err: serde_json::Error) -> Self {
        PineconeError::Parse(err.to_string())
    }
}
