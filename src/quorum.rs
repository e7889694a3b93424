use serde::Serialize;
use tracing::{debug, info};

use crate::config::QuorumConfig;
use crate::db::UnitOfWork;
use crate::error::WithdrawalError;
use crate::models::Withdrawal;

/// Counts distinct approvers of a withdrawal against the configured threshold.
///
/// Quorum is never stored, it is recounted from the approval rows every time.
#[derive(Debug, Clone, Copy)]
pub struct QuorumTracker {
    threshold: u32,
}

/// Result of recording one approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumVote {
    /// `false` when the approver had already approved, the call was a no-op.
    pub inserted: bool,
    pub approvers: i64,
    pub quorum_met: bool,
}

impl QuorumTracker {
    pub fn new(config: &QuorumConfig) -> Self {
        Self {
            threshold: config.threshold,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn quorum_met(&self, approvers: i64) -> bool {
        approvers >= i64::from(self.threshold)
    }

    /// Records `approver_id`'s confirmation inside the unit holding the withdrawal
    /// lock and recounts. A repeated confirmation is accepted without counting twice.
    pub async fn record_approval(
        &self,
        unit: &mut dyn UnitOfWork,
        withdrawal: &Withdrawal,
        approver_id: i64,
    ) -> Result<QuorumVote, WithdrawalError> {
        if approver_id <= 0 {
            return Err(WithdrawalError::InvalidInput(format!(
                "approver id must be positive, got {}",
                approver_id
            )));
        }
        if withdrawal.is_settled() {
            return Err(WithdrawalError::InvalidInput(format!(
                "withdrawal {} is already settled",
                withdrawal.id
            )));
        }

        let inserted = unit.insert_approval(approver_id).await?;
        if !inserted {
            debug!(
                "Approver {} already approved withdrawal {}",
                approver_id, withdrawal.id
            );
        }

        let approvers = unit.count_approvers().await?;
        let quorum_met = self.quorum_met(approvers);

        info!(
            "Withdrawal {} approved by {}: {}/{} approvers, quorum met: {}",
            withdrawal.id, approver_id, approvers, self.threshold, quorum_met
        );

        Ok(QuorumVote {
            inserted,
            approvers,
            quorum_met,
        })
    }
}
