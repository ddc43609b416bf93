//! Error types for the call stream service
//!
//! Each concern gets its own enum so callers can match on the failure they
//! are able to recover from. Nothing here is fatal to the process: the stream
//! code degrades or tears down a single call instead.

use crate::context::ContextKind;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Failure talking to one of the external AI services (STT, LLM, TTS).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited by upstream (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upstream returned an empty response")]
    EmptyResponse,

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Map a non-success HTTP status into the matching variant.
    pub(crate) fn from_status(status: reqwest::StatusCode, retry_after: Option<u64>, body: String) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ServiceError::RateLimited { retry_after }
        } else {
            ServiceError::Status {
                status: status.as_u16(),
                body,
            }
        }
    }

    /// Pass successful responses through, turn everything else into an error.
    pub(crate) async fn check(response: reqwest::Response) -> ServiceResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = response.text().await.unwrap_or_default();
        Err(Self::from_status(status, retry_after, body))
    }
}

/// Failure resolving the conversation context for a call.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("No {kind} record with id {id}")]
    NotFound { kind: ContextKind, id: String },

    #[error("{kind} record {id} is missing its {missing}")]
    Incomplete {
        kind: ContextKind,
        id: String,
        missing: &'static str,
    },

    #[error("Context lookup unavailable: {0}")]
    Unavailable(String),
}

pub type ContextResult<T> = std::result::Result<T, ContextError>;

/// Failure persisting call records.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Record store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Cannot build record URL for call {0:?}")]
    InvalidUrl(String),
}

pub type RecordResult<T> = std::result::Result<T, RecordError>;

/// A carrier frame that could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Binary frames are not part of the media protocol ({0} bytes)")]
    Binary(usize),
}

/// Start-up configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Listener and transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
