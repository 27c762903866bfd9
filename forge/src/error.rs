use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while admitting a trigger event.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("trigger event has an empty revision id")]
    EmptyRevision,

    #[error("failed to record run for revision {revision_id}")]
    Storage {
        revision_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors returned by a [`RowReader`](crate::client::RowReader).
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("source document {resource_id} not found")]
    NotFound { resource_id: String },

    #[error("source document is malformed: {0}")]
    Malformed(String),

    #[error("failed to read source document: {0}")]
    Unavailable(String),
}

/// Errors returned by [`RenderClient::submit`](crate::client::RenderClient::submit).
///
/// Every variant is terminal for the attempt: a submission is never retried.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("malformed submission response: {0}")]
    MalformedResponse(String),

    #[error("transport error during submission: {0}")]
    Transport(String),
}

/// Errors returned by [`RenderClient::poll`](crate::client::RenderClient::poll).
#[derive(Debug, Error)]
pub enum PollError {
    /// Retried with backoff until the poll retry ceiling is reached.
    #[error("transient poll error: {0}")]
    Transient(String),

    #[error("poll failed: {0}")]
    Fatal(String),
}

impl PollError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PollError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("report delivery failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("APP_ENV is not set")]
    MissingEnvironment,

    #[error("unknown environment '{0}', expected dev, staging or prod")]
    UnknownEnvironment(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
