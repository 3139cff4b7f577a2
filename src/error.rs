use thiserror::Error;

/// Failure of a single position acquisition reported by the host.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixError {
    #[error("Location permission denied. Please enable location services.")]
    PermissionDenied,

    #[error("Location information unavailable.")]
    PositionUnavailable,

    #[error("Location request timed out.")]
    Timeout,

    #[error("Unknown error occurred.")]
    Unknown,
}

/// Errors raised when starting or querying the position sampler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    #[error("Geolocation is not supported on this device.")]
    CapabilityUnavailable,

    #[error(transparent)]
    Fix(#[from] FixError),

    #[error("Agent stopped before the fix resolved")]
    AgentStopped,
}

/// Backend HTTP call errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(u16),

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    Url(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            BackendError::Http(status.as_u16())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Session channel errors. Always logged, never surfaced to the user.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Invalid channel endpoint: {0}")]
    Endpoint(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned through [`crate::agent::AgentHandle`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent is not running")]
    Stopped,
}
