use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::db::StoreError;
use crate::reconcile::{ReconcileError, ReconcileReport};

/// Errors surfaced by the withdrawal entry points.
#[derive(Error, Debug)]
pub enum WithdrawalError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Withdrawal {0} not found")]
    NotFound(i64),

    #[error("Quorum not met for withdrawal {withdrawal_id}: {approvers}/{threshold} approvals")]
    QuorumNotMet {
        withdrawal_id: i64,
        approvers: i64,
        threshold: u32,
    },

    /// The retry budget ran out before the withdrawal ever had a transaction accepted.
    #[error("Retries exhausted for withdrawal {}", .0.withdrawal_id)]
    RetriesExhausted(ReconcileReport),

    #[error("Persistence error: {0}")]
    Persistence(StoreError),
}

impl From<StoreError> for WithdrawalError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::WithdrawalNotFound(id) => WithdrawalError::NotFound(id),
            other => WithdrawalError::Persistence(other),
        }
    }
}

impl From<ReconcileError> for WithdrawalError {
    fn from(error: ReconcileError) -> Self {
        match error {
            ReconcileError::Persistence { source, .. } => WithdrawalError::Persistence(source),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for WithdrawalError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            WithdrawalError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", None),
            WithdrawalError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "WITHDRAWAL_NOT_FOUND",
                Some(serde_json::json!({ "withdrawal_id": id })),
            ),
            WithdrawalError::QuorumNotMet {
                approvers,
                threshold,
                ..
            } => (
                StatusCode::BAD_REQUEST,
                "QUORUM_NOT_MET",
                Some(serde_json::json!({
                    "approvers": approvers,
                    "threshold": threshold,
                })),
            ),
            WithdrawalError::RetriesExhausted(report) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "RETRIES_EXHAUSTED",
                serde_json::to_value(report).ok(),
            ),
            WithdrawalError::Persistence(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR", None)
            }
        };

        let message = match &self {
            // driver details stay in the logs
            WithdrawalError::Persistence(_) => "A database error occurred".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}
