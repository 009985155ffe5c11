//! Error types for the model lifecycle core and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failure while retrieving artifacts from the remote repository
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("chunked transfer error: {message}")]
    ChunkedTransfer { message: String },

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{message}")]
    Other { message: String },
}

impl FetchError {
    /// Transient failures worth another attempt. Client/auth errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. }
            | Self::Timeout { .. }
            | Self::Tls { .. }
            | Self::ChunkedTransfer { .. } => true,
            Self::Status { status, .. } => (500..600).contains(status),
            Self::Other { .. } => false,
        }
    }
}

/// Failure raised by a concrete model during load, download or inference
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{message}")]
    Runtime { message: String },

    #[error("device placement failed: {message}")]
    Placement { message: String },

    #[error("model '{identifier}' is not loaded")]
    NotLoaded { identifier: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

/// Registry-level failures. Lookup variants are local and side-effect-free.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown model key: {key}")]
    UnknownKey { key: String },

    #[error("no model registered for task: {task}")]
    UnknownTask { task: String },

    #[error("model key already registered: {key}")]
    DuplicateKey { key: String },

    #[error(transparent)]
    Model(#[from] ModelError),
}

pub type ModelResult<T> = Result<T, ModelError>;
pub type RegistryResult<T> = Result<T, RegistryError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownKey { .. } | RegistryError::UnknownTask { .. } => {
                ApiError::NotFound(err.to_string())
            }
            RegistryError::DuplicateKey { .. } => ApiError::Conflict(err.to_string()),
            RegistryError::Model(ModelError::InvalidInput { message }) => {
                ApiError::BadRequest(message)
            }
            RegistryError::Model(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        RegistryError::Model(err).into()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

/// JSON body of every error response
#[derive(Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
    pub(crate) timestamp: chrono::DateTime<chrono::Utc>,
}
