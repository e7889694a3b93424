use serde::{Deserialize, Serialize};

use crate::models::{Approval, Withdrawal};
use crate::reconcile::ReconcileReport;

#[derive(Debug, Deserialize)]
pub struct CreateWithdrawalRequest {
    /// Decimal ether amount, kept as a string so no precision is lost in JSON.
    pub amount: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWithdrawalResponse {
    pub message: String,
    pub request_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ApproveWithdrawalRequest {
    pub manager_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ApproveWithdrawalResponse {
    pub message: String,
    pub approvers: i64,
    pub quorum_met: bool,
    pub reconciliation: Option<ReconcileReport>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteWithdrawalResponse {
    pub message: String,
    pub report: ReconcileReport,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalStatusResponse {
    pub withdrawals: Vec<Withdrawal>,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalApprovalsResponse {
    pub withdrawal_id: i64,
    pub approvals: Vec<Approval>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
