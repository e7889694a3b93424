use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Approval, Withdrawal};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Withdrawal {0} not found")]
    WithdrawalNotFound(i64),

    #[error("Withdrawal {0} is not locked by this unit of work")]
    NotLocked(i64),

    #[error("Withdrawal {0} is already settled")]
    Settled(i64),
}

/// Persistent home of withdrawals and their approvals.
#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    /// Inserts a new withdrawal in the `Unchained` state.
    async fn create_withdrawal(&self, amount: Decimal) -> Result<Withdrawal, StoreError>;

    /// `None` lists every withdrawal ordered by id.
    async fn find_withdrawals(&self, id: Option<i64>) -> Result<Vec<Withdrawal>, StoreError>;

    async fn find_approvals(&self, withdrawal_id: i64) -> Result<Vec<Approval>, StoreError>;

    /// Opens a unit of work that exclusively owns the withdrawal row until it is
    /// committed, rolled back or dropped. Waits while another unit holds the row and
    /// returns the row as it is once the lock is granted.
    async fn lock_withdrawal(
        &self,
        id: i64,
    ) -> Result<(Withdrawal, Box<dyn UnitOfWork>), StoreError>;
}

/// Atomic read-modify-write scope over a single locked withdrawal.
///
/// Nothing written through a unit is visible to others before `commit`. Dropping a
/// unit without committing discards its writes and releases the lock.
#[async_trait]
pub trait UnitOfWork: Send {
    fn withdrawal_id(&self) -> i64;

    /// Returns `false` when this approver had already approved the withdrawal.
    async fn insert_approval(&mut self, approver_id: i64) -> Result<bool, StoreError>;

    /// Number of distinct approvers, including approvals inserted by this unit.
    async fn count_approvers(&mut self) -> Result<i64, StoreError>;

    /// Writes `status` and `ledger_tx_ref` in one statement and refreshes `updated_at`.
    async fn save_withdrawal(&mut self, withdrawal: &mut Withdrawal) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
