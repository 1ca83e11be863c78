use thiserror::Error;

/// Failure taxonomy for the gateway core.
///
/// Every failure is per-flow: errors surface to the caller as a structured
/// kind plus message and are never retried inside the core. Credential
/// values must not appear in any variant's message.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration document unreadable or malformed. Fatal at startup.
    #[error("Config error: {0}")]
    Config(String),

    /// The requested model name is absent from the registry.
    #[error("model {0} not found in the configuration")]
    ModelNotFound(String),

    /// The model is declared, but every entry for it is disabled.
    #[error("no enabled service for model {0} found in the configuration")]
    NoEnabledService(String),

    /// A rate/concurrency acquire timed out.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The backend returned a non-success envelope status.
    #[error("Backend error {code}: {message}")]
    Backend { code: i64, message: String },

    /// A streaming event was malformed or of an unrecognized kind.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network/IO failure reaching or reading the backend.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

impl GatewayError {
    /// HTTP status to report for this failure at the serving surface.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            GatewayError::Config(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ModelNotFound(_) => http::StatusCode::NOT_FOUND,
            GatewayError::NoEnabledService(_) => http::StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ResourceExhausted(_) => http::StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Backend { .. }
            | GatewayError::Protocol(_)
            | GatewayError::Transport(_) => http::StatusCode::BAD_GATEWAY,
        }
    }
}
