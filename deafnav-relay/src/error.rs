//! Error taxonomy of the relay.
//!
//! None of these terminate the process: each one is caught where it happens,
//! logged, and replaced by a fallback (dropped message, stale snapshot,
//! skipped write).

/// Inbound transport payload could not be turned into a telemetry record.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed telemetry payload: {0}")]
    MalformedPayload(String),
}

/// Provider fetch failure. The previous snapshot stays in place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("provider fetch timed out")]
    Timeout,
    #[error("provider unreachable: {0}")]
    Unreachable(String),
    #[error("provider answered with status {0}")]
    BadStatus(u16),
    #[error("provider payload is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::BadStatus(status.as_u16())
        } else if err.is_decode() {
            FetchError::InvalidPayload(err.to_string())
        } else {
            FetchError::Unreachable(err.to_string())
        }
    }
}

/// Persistence sink write failure. Logged, never retried.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persistence write failed: {0}")]
    WriteFailed(String),
}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        PersistError::WriteFailed(err.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::WriteFailed(err.to_string())
    }
}

/// Returned by a broadcast that reached nobody. Callers treat it as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    #[error("no subscriber matched the broadcast")]
    NoSubscribers,
}

/// Startup presence checks on the configuration surface.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(&'static str),
    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
