use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::ledger::models::WorkerKey;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Fee ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("No ledger entry for {key}")]
    NotFound { key: WorkerKey },

    #[error("Insufficient pending fees for {key}: requested {requested}, available {available}")]
    InsufficientPending {
        key: WorkerKey,
        requested: i64,
        available: i64,
    },

    #[error("Negative amount rejected: {0}")]
    NegativeAmount(i64),

    #[error("Fee arithmetic overflow for {key}")]
    Overflow { key: WorkerKey },

    #[error("Event {event_id} from source {source_id} is already logged")]
    DuplicateEvent { source_id: String, event_id: i64 },
}

/// Settlement (value transfer) errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Network fee rate {current} exceeds cap {cap}")]
    FeeRateTooHigh { current: u128, cap: u128 },

    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("Invalid transfer amount: {0}")]
    InvalidAmount(i64),

    #[error("RPC failure during {stage}: {message}")]
    Rpc { stage: &'static str, message: String },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Timed out during {stage}")]
    Timeout { stage: &'static str },

    #[error("Submission of {tx_hash} timed out, outcome unknown")]
    SubmissionUnknown { tx_hash: String },
}

impl SettlementError {
    /// True when value may have left the pool even though no confirmation came back.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, SettlementError::SubmissionUnknown { .. })
    }
}

/// Data source polling errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {endpoint}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("Could not decode response: {0}")]
    Decode(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::InvalidInput(reason) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                reason,
                None,
            ),
            AppError::Ledger(LedgerError::NotFound { key }) => (
                StatusCode::NOT_FOUND,
                "WORKER_NOT_FOUND",
                format!("No ledger entry for worker {}", key.eth_address),
                Some(serde_json::json!({ "worker": key })),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<::config::ConfigError> for AppError {
    fn from(error: ::config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
