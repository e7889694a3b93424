use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Local view of where a withdrawal stands on the ledger.
///
/// Stored as a SMALLINT, the discriminants are part of the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    /// No ledger transaction has been accepted yet.
    Unchained = 0,
    /// A transaction was broadcast and its outcome is not known.
    Pending = 1,
    /// The ledger confirmed the transfer. Never left once reached.
    Success = 2,
    /// The ledger confirmed the transaction reverted.
    Failure = 3,
    /// Something the ledger convention does not describe, or retries ran out before
    /// anything was broadcast.
    Exception = 4,
}

impl WithdrawalStatus {
    pub fn is_terminal(self) -> bool {
        self == WithdrawalStatus::Success
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WithdrawalStatus::Unchained => "unchained",
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Success => "success",
            WithdrawalStatus::Failure => "failure",
            WithdrawalStatus::Exception => "exception",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: i64,
    pub amount: Decimal,
    pub ledger_tx_ref: Option<String>,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn new(id: i64, amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id,
            amount,
            ledger_tx_ref: None,
            status: WithdrawalStatus::Unchained,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status.is_terminal()
    }

    /// Eligible for the reconciliation that a freshly met quorum kicks off.
    pub fn awaits_first_submission(&self) -> bool {
        self.ledger_tx_ref.is_none() && self.status == WithdrawalStatus::Unchained
    }
}

/// One manager's sign-off on a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Approval {
    pub id: i64,
    pub withdrawal_id: i64,
    pub approver_id: i64,
    pub created_at: DateTime<Utc>,
}
