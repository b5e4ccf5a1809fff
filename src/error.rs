use thiserror::Error;

/// Main error type for the operations console core
#[derive(Error, Debug)]
pub enum OpsdeckError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Missing backend base address or an invalid setting. Fatal to the
    /// component that hits it; never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Non-2xx response or timeout, carrying the server detail when present
    #[error("Transport error: {0}")]
    Transport(String),

    // Authentication errors
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // State machine errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl OpsdeckError {
    /// Network-level failure the calling workflow recovers from locally
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            OpsdeckError::Http(_)
                | OpsdeckError::WebSocket(_)
                | OpsdeckError::Transport(_)
                | OpsdeckError::Io(_)
        )
    }

    /// Message shown to the operator verbatim
    pub fn operator_message(&self) -> String {
        match self {
            OpsdeckError::Transport(detail)
            | OpsdeckError::Validation(detail)
            | OpsdeckError::Unauthenticated(detail)
            | OpsdeckError::Configuration(detail)
            | OpsdeckError::InvalidState(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for OpsdeckError
pub type Result<T> = std::result::Result<T, OpsdeckError>;
