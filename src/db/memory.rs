//! In-process [`WithdrawalStore`] with the same isolation as the Postgres one.
//!
//! Each withdrawal has its own async mutex standing in for the row lock, and a unit
//! of work stages its writes until commit. Used by the test-suite and by local runs
//! started with `--memory-store`.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::store::{StoreError, UnitOfWork, WithdrawalStore};
use crate::models::{Approval, Withdrawal, WithdrawalStatus};

#[derive(Debug, Default)]
struct Tables {
    last_withdrawal_id: i64,
    last_approval_id: i64,
    withdrawals: BTreeMap<i64, Withdrawal>,
    approvals: Vec<Approval>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    row_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row_lock(&self, id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().await;
        locks.entry(id).or_default().clone()
    }
}

#[async_trait]
impl WithdrawalStore for MemoryStore {
    async fn create_withdrawal(&self, amount: Decimal) -> Result<Withdrawal, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.last_withdrawal_id += 1;

        let withdrawal = Withdrawal::new(tables.last_withdrawal_id, amount);
        tables.withdrawals.insert(withdrawal.id, withdrawal.clone());

        Ok(withdrawal)
    }

    async fn find_withdrawals(&self, id: Option<i64>) -> Result<Vec<Withdrawal>, StoreError> {
        let tables = self.tables.lock().await;
        let withdrawals = match id {
            Some(id) => tables.withdrawals.get(&id).cloned().into_iter().collect(),
            None => tables.withdrawals.values().cloned().collect(),
        };
        Ok(withdrawals)
    }

    async fn find_approvals(&self, withdrawal_id: i64) -> Result<Vec<Approval>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .approvals
            .iter()
            .filter(|approval| approval.withdrawal_id == withdrawal_id)
            .cloned()
            .collect())
    }

    async fn lock_withdrawal(
        &self,
        id: i64,
    ) -> Result<(Withdrawal, Box<dyn UnitOfWork>), StoreError> {
        if !self.tables.lock().await.withdrawals.contains_key(&id) {
            return Err(StoreError::WithdrawalNotFound(id));
        }

        let guard = self.row_lock(id).await.lock_owned().await;

        // read only after the lock is granted so waiters see the previous holder's commit
        let withdrawal = self
            .tables
            .lock()
            .await
            .withdrawals
            .get(&id)
            .cloned()
            .ok_or(StoreError::WithdrawalNotFound(id))?;

        Ok((
            withdrawal,
            Box::new(MemoryUnitOfWork {
                store: self.clone(),
                withdrawal_id: id,
                staged_withdrawal: None,
                staged_approvers: Vec::new(),
                _guard: guard,
            }),
        ))
    }
}

struct MemoryUnitOfWork {
    store: MemoryStore,
    withdrawal_id: i64,
    staged_withdrawal: Option<Withdrawal>,
    staged_approvers: Vec<i64>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn withdrawal_id(&self) -> i64 {
        self.withdrawal_id
    }

    async fn insert_approval(&mut self, approver_id: i64) -> Result<bool, StoreError> {
        if self.staged_approvers.contains(&approver_id) {
            return Ok(false);
        }

        let withdrawal_id = self.withdrawal_id;
        let committed = self
            .store
            .tables
            .lock()
            .await
            .approvals
            .iter()
            .any(|approval| {
                approval.withdrawal_id == withdrawal_id && approval.approver_id == approver_id
            });
        if committed {
            return Ok(false);
        }

        self.staged_approvers.push(approver_id);
        Ok(true)
    }

    async fn count_approvers(&mut self) -> Result<i64, StoreError> {
        let tables = self.store.tables.lock().await;
        let approvers: HashSet<i64> = tables
            .approvals
            .iter()
            .filter(|approval| approval.withdrawal_id == self.withdrawal_id)
            .map(|approval| approval.approver_id)
            .chain(self.staged_approvers.iter().copied())
            .collect();

        Ok(approvers.len() as i64)
    }

    async fn save_withdrawal(&mut self, withdrawal: &mut Withdrawal) -> Result<(), StoreError> {
        if withdrawal.id != self.withdrawal_id {
            return Err(StoreError::NotLocked(withdrawal.id));
        }

        let current_status = match &self.staged_withdrawal {
            Some(staged) => staged.status,
            None => self
                .store
                .tables
                .lock()
                .await
                .withdrawals
                .get(&withdrawal.id)
                .map(|stored| stored.status)
                .ok_or(StoreError::WithdrawalNotFound(withdrawal.id))?,
        };
        if current_status == WithdrawalStatus::Success {
            return Err(StoreError::Settled(withdrawal.id));
        }

        withdrawal.updated_at = Utc::now();
        self.staged_withdrawal = Some(withdrawal.clone());

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryUnitOfWork {
            store,
            withdrawal_id,
            staged_withdrawal,
            staged_approvers,
            _guard,
        } = *self;
        let mut tables = store.tables.lock().await;

        if let Some(withdrawal) = staged_withdrawal {
            tables.withdrawals.insert(withdrawal.id, withdrawal);
        }

        for approver_id in staged_approvers {
            tables.last_approval_id += 1;
            let approval = Approval {
                id: tables.last_approval_id,
                withdrawal_id,
                approver_id,
                created_at: Utc::now(),
            };
            tables.approvals.push(approval);
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
