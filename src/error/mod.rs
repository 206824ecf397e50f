use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Backend returned HTTP {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("Failed to parse backend response: {0}")]
    Parse(String),

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("No providers are available")]
    NoProvidersAvailable,

    #[error("Provider '{0}' not found or not enabled")]
    ProviderNotFound(String),

    #[error("Provider kind '{0}' is not supported")]
    UnsupportedProviderKind(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Workflow engine error: {0}")]
    Workflow(String),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn protocol(status: u16, body: impl Into<String>) -> Self {
        Error::Protocol {
            status,
            body: body.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn circuit_open(name: impl Into<String>) -> Self {
        Error::CircuitOpen { name: name.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn workflow(msg: impl Into<String>) -> Self {
        Error::Workflow(msg.into())
    }

    /// Connection-level failures and timeouts. These are always worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }

    /// HTTP status of a protocol error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_decode() {
            Error::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Error::Protocol {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Error::Transport(err.to_string())
        }
    }
}

/// Passes 2xx responses through; anything else becomes [`Error::Protocol`] carrying the body.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::protocol(status.as_u16(), body))
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Validation(err.to_string())
    }
}
