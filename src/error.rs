use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::DatasetType;
use crate::utils::{error_codes, error_response};

/// Errors raised by the admission and ingestion core.
#[derive(Debug, Error)]
pub enum Error {
    /// A shared store (counter store or record store) is unreachable or timed out.
    #[error("{store} unavailable: {message}")]
    TransientInfra {
        store: &'static str,
        message: String,
    },

    /// An upstream source failed in a way that may succeed later (network, 5xx, timeout).
    #[error("transient failure from {source_name}: {message}")]
    TransientUpstream {
        source_name: String,
        message: String,
    },

    /// An upstream source rejected the request or returned a payload we cannot read.
    #[error("permanent failure from {source_name}: {message}")]
    PermanentUpstream {
        source_name: String,
        message: String,
    },

    /// Unknown dataset type, missing plan, unparsable setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The record store rejected a statement for a reason other than availability.
    #[error("storage error: {0}")]
    Storage(String),

    /// A manual trigger hit a dataset whose slot is not idle.
    #[error("ingestion for {0} is already running")]
    AlreadyRunning(DatasetType),

    /// The job was cancelled by shutdown.
    #[error("job cancelled by shutdown")]
    Cancelled,

    /// A job task panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Serializable classification of an [`Error`], recorded on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientInfra,
    TransientUpstream,
    PermanentUpstream,
    Configuration,
    Storage,
    AlreadyRunning,
    Cancelled,
    Internal,
}

impl Error {
    pub fn transient_upstream(source_name: impl Into<String>, message: impl ToString) -> Self {
        Self::TransientUpstream {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    pub fn permanent_upstream(source_name: impl Into<String>, message: impl ToString) -> Self {
        Self::PermanentUpstream {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientInfra { .. } => ErrorKind::TransientInfra,
            Self::TransientUpstream { .. } => ErrorKind::TransientUpstream,
            Self::PermanentUpstream { .. } => ErrorKind::PermanentUpstream,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Storage(_) => ErrorKind::Storage,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientInfra { .. } | Self::TransientUpstream { .. }
        )
    }

    /// Returns `true` when the failure needs a code or configuration fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::PermanentUpstream { .. } | Self::Configuration(_) | Self::Storage(_)
        )
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::TransientInfra {
            store: "counter store",
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::TransientInfra {
                store: "record store",
                message: err.to_string(),
            },
            other => Self::Storage(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code, hint) = match &self {
            Self::TransientInfra { .. } | Self::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                error_codes::SERVICE_UNAVAILABLE,
                Some("Retry shortly"),
            ),
            Self::TransientUpstream { .. } | Self::PermanentUpstream { .. } => (
                StatusCode::BAD_GATEWAY,
                error_codes::UPSTREAM_ERROR,
                None,
            ),
            Self::Configuration(_) => (
                StatusCode::BAD_REQUEST,
                error_codes::VALIDATION_ERROR,
                None,
            ),
            Self::AlreadyRunning(_) => (
                StatusCode::CONFLICT,
                error_codes::ALREADY_RUNNING,
                Some("Wait for the running job to finish and check its status"),
            ),
            Self::Storage(_) | Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                Some("Please contact support if this persists"),
            ),
        };

        error_response(status, code, &self.to_string(), hint)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
