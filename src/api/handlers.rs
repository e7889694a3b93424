use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::models::{
    ApproveWithdrawalRequest, ApproveWithdrawalResponse, CreateWithdrawalRequest,
    CreateWithdrawalResponse, ExecuteWithdrawalResponse, HealthResponse,
    WithdrawalApprovalsResponse, WithdrawalStatusResponse,
};
use crate::api::routes::AppState;
use crate::error::WithdrawalError;
use crate::reconcile::ReconcileOutcome;

pub async fn handle_create_withdrawal(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateWithdrawalRequest>,
) -> Result<Json<CreateWithdrawalResponse>, WithdrawalError> {
    let withdrawal = state.service.create(&payload.amount).await?;

    Ok(Json(CreateWithdrawalResponse {
        message: "Withdrawal request created".to_string(),
        request_id: withdrawal.id,
    }))
}

pub async fn handle_approve_withdrawal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<ApproveWithdrawalRequest>,
) -> Result<Json<ApproveWithdrawalResponse>, WithdrawalError> {
    let receipt = state.service.approve(id, payload.manager_id).await?;

    let message = match (&receipt.reconciliation, receipt.vote.inserted) {
        (Some(report), _) => format!(
            "Approval recorded, quorum met, withdrawal is {}",
            report.status
        ),
        (None, false) => "Approval already recorded".to_string(),
        (None, true) if receipt.vote.quorum_met => "Approval recorded, quorum met".to_string(),
        (None, true) => "Approval recorded, waiting for quorum".to_string(),
    };

    Ok(Json(ApproveWithdrawalResponse {
        message,
        approvers: receipt.vote.approvers,
        quorum_met: receipt.vote.quorum_met,
        reconciliation: receipt.reconciliation,
    }))
}

pub async fn handle_execute_withdrawal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ExecuteWithdrawalResponse>, WithdrawalError> {
    let report = state.service.execute(id).await?;

    let message = match report.outcome {
        ReconcileOutcome::Settled => "Withdrawal settled on ledger".to_string(),
        ReconcileOutcome::AlreadySettled => "Withdrawal was already settled".to_string(),
        ReconcileOutcome::RetriesExhausted => {
            format!("Retries exhausted, withdrawal is {}", report.status)
        }
    };

    Ok(Json(ExecuteWithdrawalResponse { message, report }))
}

pub async fn handle_withdrawal_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<WithdrawalStatusResponse>, WithdrawalError> {
    let withdrawals = state.service.status(id).await?;
    Ok(Json(WithdrawalStatusResponse { withdrawals }))
}

pub async fn handle_withdrawal_approvals(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<WithdrawalApprovalsResponse>, WithdrawalError> {
    let approvals = state.service.approvals(id).await?;
    Ok(Json(WithdrawalApprovalsResponse {
        withdrawal_id: id,
        approvals,
    }))
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
