use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::db::{UnitOfWork, WithdrawalStore};
use crate::error::WithdrawalError;
use crate::ledger::{with_timeout, LedgerClient, WEI_DECIMALS};
use crate::models::{Approval, Withdrawal, WithdrawalStatus};
use crate::quorum::{QuorumTracker, QuorumVote};
use crate::reconcile::{ReconcileOutcome, ReconcileReport, ReconciliationEngine};

/// Outcome of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalReceipt {
    pub withdrawal_id: i64,
    pub vote: QuorumVote,
    /// Present when this approval met the quorum and kicked off reconciliation.
    pub reconciliation: Option<ReconcileReport>,
}

/// Entry points of the withdrawal workflow.
///
/// Approve and execute run entirely inside one unit of work holding the withdrawal's
/// row lock: the approval insert, the recount and any reconciliation commit or roll
/// back together, and a concurrent request on the same withdrawal waits for them.
pub struct WithdrawalService {
    store: Arc<dyn WithdrawalStore>,
    engine: ReconciliationEngine,
    quorum: QuorumTracker,
    call_timeout: Duration,
}

impl WithdrawalService {
    pub fn new(
        store: Arc<dyn WithdrawalStore>,
        ledger: Arc<dyn LedgerClient>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            engine: ReconciliationEngine::new(ledger, config.reconcile.clone()),
            quorum: QuorumTracker::new(&config.quorum),
            call_timeout: config.reconcile.call_timeout(),
        }
    }

    pub async fn create(&self, amount: &str) -> Result<Withdrawal, WithdrawalError> {
        let amount = parse_amount(amount)?;
        let withdrawal = self.store.create_withdrawal(amount).await?;

        info!("Created withdrawal {} for {}", withdrawal.id, withdrawal.amount);
        Ok(withdrawal)
    }

    pub async fn approve(
        &self,
        id: i64,
        approver_id: i64,
    ) -> Result<ApprovalReceipt, WithdrawalError> {
        validate_id(id)?;
        if approver_id <= 0 {
            return Err(WithdrawalError::InvalidInput(format!(
                "manager id must be positive, got {}",
                approver_id
            )));
        }

        let (mut withdrawal, mut unit) = self.store.lock_withdrawal(id).await?;

        match self
            .approve_locked(&mut withdrawal, unit.as_mut(), approver_id)
            .await
        {
            Ok(receipt) => {
                unit.commit().await?;
                Ok(receipt)
            }
            Err(e) => {
                abandon(unit, id).await;
                Err(e)
            }
        }
    }

    async fn approve_locked(
        &self,
        withdrawal: &mut Withdrawal,
        unit: &mut dyn UnitOfWork,
        approver_id: i64,
    ) -> Result<ApprovalReceipt, WithdrawalError> {
        let vote = self
            .quorum
            .record_approval(unit, withdrawal, approver_id)
            .await?;

        let reconciliation = if vote.quorum_met && withdrawal.awaits_first_submission() {
            info!(
                "Quorum met for withdrawal {}, starting reconciliation",
                withdrawal.id
            );
            Some(self.engine.reconcile(withdrawal, unit).await?)
        } else {
            None
        };

        Ok(ApprovalReceipt {
            withdrawal_id: withdrawal.id,
            vote,
            reconciliation,
        })
    }

    /// Manual reconciliation trigger. A settled withdrawal is reported as such
    /// without touching the ledger.
    pub async fn execute(&self, id: i64) -> Result<ReconcileReport, WithdrawalError> {
        validate_id(id)?;

        let (mut withdrawal, mut unit) = self.store.lock_withdrawal(id).await?;

        let report = match self.execute_locked(&mut withdrawal, unit.as_mut()).await {
            Ok(report) => report,
            Err(e) => {
                abandon(unit, id).await;
                return Err(e);
            }
        };
        unit.commit().await?;

        if report.outcome != ReconcileOutcome::AlreadySettled {
            self.log_custodial_balance().await;
        }

        if report.outcome == ReconcileOutcome::RetriesExhausted
            && report.status == WithdrawalStatus::Exception
            && report.ledger_tx_ref.is_none()
        {
            return Err(WithdrawalError::RetriesExhausted(report));
        }

        Ok(report)
    }

    async fn execute_locked(
        &self,
        withdrawal: &mut Withdrawal,
        unit: &mut dyn UnitOfWork,
    ) -> Result<ReconcileReport, WithdrawalError> {
        if !withdrawal.is_settled() {
            let approvers = unit.count_approvers().await?;
            if !self.quorum.quorum_met(approvers) {
                return Err(WithdrawalError::QuorumNotMet {
                    withdrawal_id: withdrawal.id,
                    approvers,
                    threshold: self.quorum.threshold(),
                });
            }
        }

        Ok(self.engine.reconcile(withdrawal, unit).await?)
    }

    /// `0` lists every withdrawal. An unknown id yields an empty list.
    pub async fn status(&self, id: i64) -> Result<Vec<Withdrawal>, WithdrawalError> {
        if id < 0 {
            return Err(WithdrawalError::InvalidInput(format!(
                "withdrawal id must not be negative, got {}",
                id
            )));
        }

        let filter = (id != 0).then_some(id);
        Ok(self.store.find_withdrawals(filter).await?)
    }

    pub async fn approvals(&self, id: i64) -> Result<Vec<Approval>, WithdrawalError> {
        validate_id(id)?;

        if self.store.find_withdrawals(Some(id)).await?.is_empty() {
            return Err(WithdrawalError::NotFound(id));
        }
        Ok(self.store.find_approvals(id).await?)
    }

    async fn log_custodial_balance(&self) {
        let ledger = self.engine.ledger();
        let address = ledger.custodial_address();

        match with_timeout(self.call_timeout, ledger.balance_of(&address)).await {
            Ok(balance) => info!("Custodial account {} balance: {} ETH", address, balance),
            Err(e) => warn!("Could not read balance of {}: {}", address, e),
        }
    }
}

async fn abandon(unit: Box<dyn UnitOfWork>, id: i64) {
    if let Err(e) = unit.rollback().await {
        error!("Rolling back withdrawal {} failed: {}", id, e);
    }
}

fn validate_id(id: i64) -> Result<(), WithdrawalError> {
    if id <= 0 {
        return Err(WithdrawalError::InvalidInput(format!(
            "withdrawal id must be positive, got {}",
            id
        )));
    }
    Ok(())
}

/// Parses a positive ether amount payable in whole wei.
pub fn parse_amount(raw: &str) -> Result<Decimal, WithdrawalError> {
    let amount = Decimal::from_str(raw.trim())
        .map_err(|e| WithdrawalError::InvalidInput(format!("invalid amount {:?}: {}", raw, e)))?
        .normalize();

    if amount <= Decimal::ZERO {
        return Err(WithdrawalError::InvalidInput(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if amount.scale() > WEI_DECIMALS {
        return Err(WithdrawalError::InvalidInput(format!(
            "amount {} has more than {} fractional digits",
            amount, WEI_DECIMALS
        )));
    }

    Ok(amount)
}
