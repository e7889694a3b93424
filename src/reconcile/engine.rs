use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::db::{StoreError, UnitOfWork};
use crate::ledger::{with_timeout, LedgerClient};
use crate::models::{Withdrawal, WithdrawalStatus};
use crate::reconcile::state::{
    entry_event, exhausted_status, on_observation, resume_event, Event, Observation, RetryBudget,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Failed to persist withdrawal {withdrawal_id}: {source}")]
    Persistence {
        withdrawal_id: i64,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The ledger confirmed the transfer during this invocation.
    Settled,
    /// The retry budget ran out, the status holds the last observation.
    RetriesExhausted,
    /// The withdrawal was settled before the invocation started, nothing was done.
    AlreadySettled,
}

/// Summary of one reconciliation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub withdrawal_id: i64,
    pub status: WithdrawalStatus,
    pub ledger_tx_ref: Option<String>,
    pub retries: u32,
    /// Transactions accepted by the ledger during this invocation.
    pub submissions: u32,
    pub outcome: ReconcileOutcome,
}

/// Submits, polls and resubmits a withdrawal's ledger transaction until it settles
/// or the retry budget is spent.
#[derive(Clone)]
pub struct ReconciliationEngine {
    ledger: Arc<dyn LedgerClient>,
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: ReconcileConfig) -> Self {
        Self { ledger, config }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Runs one invocation for a withdrawal whose row lock is held by `unit`.
    ///
    /// Every change of status or ledger reference is written through `unit` before
    /// the next event is handled. A failed write stops the invocation on the spot,
    /// with no further ledger calls.
    pub async fn reconcile(
        &self,
        withdrawal: &mut Withdrawal,
        unit: &mut dyn UnitOfWork,
    ) -> Result<ReconcileReport, ReconcileError> {
        StateMachine {
            state: withdrawal.status,
            retries: RetryBudget::new(self.config.max_retries),
            submissions: 0,
            withdrawal,
            unit,
            ledger: self.ledger.as_ref(),
            config: &self.config,
        }
        .run()
        .await
    }
}

struct StateMachine<'a, 'u> {
    state: WithdrawalStatus,
    retries: RetryBudget,
    submissions: u32,
    withdrawal: &'a mut Withdrawal,
    unit: &'a mut (dyn UnitOfWork + 'u),
    ledger: &'a dyn LedgerClient,
    config: &'a ReconcileConfig,
}

impl StateMachine<'_, '_> {
    async fn run(mut self) -> Result<ReconcileReport, ReconcileError> {
        let Some(mut event) = entry_event(&*self.withdrawal) else {
            info!(
                "Withdrawal {} is already settled, nothing to reconcile",
                self.withdrawal.id
            );
            return Ok(self.report(ReconcileOutcome::AlreadySettled));
        };

        loop {
            event = match event {
                Event::Start => self.submit().await?,
                Event::Check => self.check().await?,
                Event::Retry => self.retry().await,
                Event::MaxRetriesReached => {
                    return self.give_up().await;
                }
                Event::Succeeded => {
                    info!(
                        "Withdrawal {} settled: tx={:?}, retries={}",
                        self.withdrawal.id,
                        self.withdrawal.ledger_tx_ref,
                        self.retries.used()
                    );
                    return Ok(self.report(ReconcileOutcome::Settled));
                }
            };
        }
    }

    async fn submit(&mut self) -> Result<Event, ReconcileError> {
        let submitted = with_timeout(
            self.config.call_timeout(),
            self.ledger.submit_transfer(self.withdrawal.amount),
        )
        .await;

        match submitted {
            Ok(tx_ref) => {
                info!(
                    "Withdrawal {} submitted to ledger: tx={}",
                    self.withdrawal.id, tx_ref
                );
                self.submissions += 1;
                self.state = WithdrawalStatus::Pending;
                self.withdrawal.ledger_tx_ref = Some(tx_ref);
                self.withdrawal.status = WithdrawalStatus::Pending;
                self.persist().await?;
                Ok(Event::Check)
            }
            Err(e) => {
                warn!(
                    "Submitting withdrawal {} failed (retry {}/{}): {}",
                    self.withdrawal.id,
                    self.retries.used(),
                    self.retries.max(),
                    e
                );
                self.state = WithdrawalStatus::Unchained;
                Ok(Event::Retry)
            }
        }
    }

    async fn check(&mut self) -> Result<Event, ReconcileError> {
        let Some(tx_ref) = self.withdrawal.ledger_tx_ref.clone() else {
            self.state = WithdrawalStatus::Unchained;
            return Ok(Event::Start);
        };

        let observation: Observation = with_timeout(
            self.config.call_timeout(),
            self.ledger.transaction_outcome(&tx_ref),
        )
        .await
        .into();

        match &observation {
            Observation::NotYetObserved => debug!(
                "Withdrawal {} tx {} not yet observed on ledger",
                self.withdrawal.id, tx_ref
            ),
            Observation::Confirmed => {}
            Observation::LedgerOutcomeFailure => warn!(
                "Withdrawal {} tx {} failed on ledger, will resubmit",
                self.withdrawal.id, tx_ref
            ),
            Observation::LedgerOutcomeUnrecognized(code) => error!(
                "Withdrawal {} tx {} has unrecognized receipt status {:?}, will resubmit",
                self.withdrawal.id, tx_ref, code
            ),
            Observation::LedgerTransient(e) => warn!(
                "Polling withdrawal {} tx {} failed: {}",
                self.withdrawal.id, tx_ref, e
            ),
        }

        let step = on_observation(&observation);
        self.state = step.state;
        if step.record && self.withdrawal.status != step.state {
            self.withdrawal.status = step.state;
            self.persist().await?;
        }

        Ok(step.next)
    }

    async fn retry(&mut self) -> Event {
        if !self.retries.consume() {
            return Event::MaxRetriesReached;
        }

        debug!(
            "Withdrawal {} retry {}/{} in {:?} (state {})",
            self.withdrawal.id,
            self.retries.used(),
            self.retries.max(),
            self.config.retry_delay(),
            self.state
        );
        sleep(self.config.retry_delay()).await;

        resume_event(self.state)
    }

    async fn give_up(mut self) -> Result<ReconcileReport, ReconcileError> {
        error!(
            "Max retries reached for withdrawal {}: retries={}, state={}",
            self.withdrawal.id,
            self.retries.used(),
            self.state
        );

        if let Some(status) = exhausted_status(self.state) {
            self.withdrawal.status = status;
            self.persist().await?;
        }

        Ok(self.report(ReconcileOutcome::RetriesExhausted))
    }

    async fn persist(&mut self) -> Result<(), ReconcileError> {
        self.unit
            .save_withdrawal(self.withdrawal)
            .await
            .map_err(|source| {
                error!(
                    "Failed to persist withdrawal {} (status {}, tx {:?}): {}",
                    self.withdrawal.id, self.withdrawal.status, self.withdrawal.ledger_tx_ref, source
                );
                ReconcileError::Persistence {
                    withdrawal_id: self.withdrawal.id,
                    source,
                }
            })
    }

    fn report(&self, outcome: ReconcileOutcome) -> ReconcileReport {
        ReconcileReport {
            withdrawal_id: self.withdrawal.id,
            status: self.withdrawal.status,
            ledger_tx_ref: self.withdrawal.ledger_tx_ref.clone(),
            retries: self.retries.used(),
            submissions: self.submissions,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, WithdrawalStore};
    use crate::ledger::{LedgerError, LedgerOutcome, MockLedgerClient};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> ReconcileConfig {
        ReconcileConfig {
            max_retries: 3,
            retry_delay_ms: 0,
            call_timeout_ms: 1_000,
        }
    }

    fn tx_hash(n: usize) -> String {
        format!("0x{:064x}", n)
    }

    async fn seeded_store(status: WithdrawalStatus, ledger_tx_ref: Option<&str>) -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let created = store.create_withdrawal(Decimal::ONE).await.unwrap();

        if status != WithdrawalStatus::Unchained || ledger_tx_ref.is_some() {
            let (mut withdrawal, mut unit) = store.lock_withdrawal(created.id).await.unwrap();
            withdrawal.status = status;
            withdrawal.ledger_tx_ref = ledger_tx_ref.map(str::to_string);
            unit.save_withdrawal(&mut withdrawal).await.unwrap();
            unit.commit().await.unwrap();
        }

        (store, created.id)
    }

    async fn reconcile_and_commit(
        engine: &ReconciliationEngine,
        store: &MemoryStore,
        id: i64,
    ) -> (ReconcileReport, Withdrawal) {
        let (mut withdrawal, mut unit) = store.lock_withdrawal(id).await.unwrap();
        let report = engine
            .reconcile(&mut withdrawal, unit.as_mut())
            .await
            .unwrap();
        unit.commit().await.unwrap();

        let stored = store.find_withdrawals(Some(id)).await.unwrap().remove(0);
        (report, stored)
    }

    #[tokio::test]
    async fn test_submit_then_confirmed_on_first_poll() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .withf(|amount| *amount == Decimal::ONE)
            .times(1)
            .returning(|_| Ok(tx_hash(1)));
        ledger
            .expect_transaction_outcome()
            .withf(|tx_ref| tx_ref == tx_hash(1))
            .times(1)
            .returning(|_| Ok(LedgerOutcome::Success));

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::Settled);
        assert_eq!(report.retries, 0);
        assert_eq!(report.submissions, 1);
        assert_eq!(stored.status, WithdrawalStatus::Success);
        assert_eq!(stored.ledger_tx_ref, Some(tx_hash(1)));
    }

    #[tokio::test]
    async fn test_never_observed_exhausts_retries_and_stays_pending() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .times(1)
            .returning(|_| Ok(tx_hash(1)));
        // first poll plus one per retry
        ledger
            .expect_transaction_outcome()
            .times(4)
            .returning(|_| Ok(LedgerOutcome::NotYetObserved));

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::RetriesExhausted);
        assert_eq!(report.retries, 3);
        assert_eq!(stored.status, WithdrawalStatus::Pending);
        assert_eq!(stored.ledger_tx_ref, Some(tx_hash(1)));
    }

    #[tokio::test]
    async fn test_failing_submissions_end_in_exception() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .times(4)
            .returning(|_| Err(LedgerError::Rpc("insufficient funds for gas".to_string())));
        ledger.expect_transaction_outcome().never();

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::RetriesExhausted);
        assert_eq!(report.retries, 3);
        assert_eq!(report.submissions, 0);
        assert_eq!(stored.status, WithdrawalStatus::Exception);
        assert_eq!(stored.ledger_tx_ref, None);
    }

    #[tokio::test]
    async fn test_ledger_failure_triggers_resubmission() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let submitted = AtomicUsize::new(0);
        let polled = AtomicUsize::new(0);
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .times(2)
            .returning(move |_| Ok(tx_hash(submitted.fetch_add(1, Ordering::SeqCst) + 1)));
        ledger
            .expect_transaction_outcome()
            .times(2)
            .returning(move |_| match polled.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(LedgerOutcome::Failure),
                _ => Ok(LedgerOutcome::Success),
            });

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::Settled);
        assert_eq!(report.retries, 1);
        assert_eq!(report.submissions, 2);
        assert_eq!(stored.status, WithdrawalStatus::Success);
        assert_eq!(stored.ledger_tx_ref, Some(tx_hash(2)));
    }

    #[tokio::test]
    async fn test_persistent_failure_keeps_failure_status() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let submitted = AtomicUsize::new(0);
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .times(4)
            .returning(move |_| Ok(tx_hash(submitted.fetch_add(1, Ordering::SeqCst) + 1)));
        ledger
            .expect_transaction_outcome()
            .times(4)
            .returning(|_| Ok(LedgerOutcome::Failure));

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::RetriesExhausted);
        assert_eq!(stored.status, WithdrawalStatus::Failure);
        assert_eq!(stored.ledger_tx_ref, Some(tx_hash(4)));
    }

    #[tokio::test]
    async fn test_unrecognized_outcome_is_left_as_exception() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let submitted = AtomicUsize::new(0);
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .times(4)
            .returning(move |_| Ok(tx_hash(submitted.fetch_add(1, Ordering::SeqCst) + 1)));
        ledger
            .expect_transaction_outcome()
            .times(4)
            .returning(|_| Ok(LedgerOutcome::Unrecognized(Some(2))));

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::RetriesExhausted);
        assert_eq!(report.submissions, 4);
        assert_eq!(stored.status, WithdrawalStatus::Exception);
        assert!(stored.ledger_tx_ref.is_some());
    }

    #[tokio::test]
    async fn test_existing_reference_is_polled_not_resubmitted() {
        let (store, id) = seeded_store(WithdrawalStatus::Pending, Some("0x0a")).await;

        let mut ledger = MockLedgerClient::new();
        ledger.expect_submit_transfer().never();
        ledger
            .expect_transaction_outcome()
            .withf(|tx_ref| tx_ref == "0x0a")
            .times(4)
            .returning(|_| Ok(LedgerOutcome::NotYetObserved));

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::RetriesExhausted);
        assert_eq!(report.submissions, 0);
        assert_eq!(stored.status, WithdrawalStatus::Pending);
        assert_eq!(stored.ledger_tx_ref.as_deref(), Some("0x0a"));
    }

    #[tokio::test]
    async fn test_poll_errors_keep_polling_the_same_reference() {
        let (store, id) = seeded_store(WithdrawalStatus::Failure, Some("0x0b")).await;

        let mut ledger = MockLedgerClient::new();
        ledger.expect_submit_transfer().never();
        ledger
            .expect_transaction_outcome()
            .times(4)
            .returning(|_| Err(LedgerError::Rpc("connection refused".to_string())));

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::RetriesExhausted);
        // nothing new was learned about the transaction
        assert_eq!(stored.status, WithdrawalStatus::Failure);
        assert_eq!(stored.ledger_tx_ref.as_deref(), Some("0x0b"));
    }

    #[tokio::test]
    async fn test_settled_withdrawal_is_left_alone() {
        let (store, id) = seeded_store(WithdrawalStatus::Success, Some("0x0c")).await;

        let mut ledger = MockLedgerClient::new();
        ledger.expect_submit_transfer().never();
        ledger.expect_transaction_outcome().never();

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.outcome, ReconcileOutcome::AlreadySettled);
        assert_eq!(stored.status, WithdrawalStatus::Success);
        assert_eq!(stored.ledger_tx_ref.as_deref(), Some("0x0c"));
    }

    #[tokio::test]
    async fn test_zero_retry_budget_polls_once() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .times(1)
            .returning(|_| Ok(tx_hash(1)));
        ledger
            .expect_transaction_outcome()
            .times(1)
            .returning(|_| Ok(LedgerOutcome::NotYetObserved));

        let config = ReconcileConfig {
            max_retries: 0,
            ..fast_config()
        };
        let engine = ReconciliationEngine::new(Arc::new(ledger), config);
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(report.retries, 0);
        assert_eq!(stored.status, WithdrawalStatus::Pending);
    }

    struct BrokenUnit;

    #[async_trait]
    impl UnitOfWork for BrokenUnit {
        fn withdrawal_id(&self) -> i64 {
            1
        }

        async fn insert_approval(&mut self, _approver_id: i64) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn count_approvers(&mut self) -> Result<i64, StoreError> {
            Ok(0)
        }

        async fn save_withdrawal(&mut self, _withdrawal: &mut Withdrawal) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_stops_ledger_interaction() {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_submit_transfer()
            .times(1)
            .returning(|_| Ok(tx_hash(1)));
        ledger.expect_transaction_outcome().never();

        let engine = ReconciliationEngine::new(Arc::new(ledger), fast_config());
        let mut withdrawal = Withdrawal::new(1, Decimal::ONE);
        let mut unit = BrokenUnit;

        let result = engine.reconcile(&mut withdrawal, &mut unit).await;

        assert!(matches!(
            result,
            Err(ReconcileError::Persistence { withdrawal_id: 1, .. })
        ));
    }

    /// Ledger that never answers within the engine's call timeout.
    struct HangingLedger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LedgerClient for HangingLedger {
        async fn submit_transfer(&self, _amount: Decimal) -> Result<String, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_secs(60)).await;
            Ok(tx_hash(1))
        }

        async fn transaction_outcome(&self, _tx_ref: &str) -> Result<LedgerOutcome, LedgerError> {
            Ok(LedgerOutcome::NotYetObserved)
        }

        async fn balance_of(&self, _address: &str) -> Result<Decimal, LedgerError> {
            Ok(Decimal::ZERO)
        }

        fn custodial_address(&self) -> String {
            "0x0".to_string()
        }
    }

    #[tokio::test]
    async fn test_hung_submission_times_out_and_consumes_retries() {
        let (store, id) = seeded_store(WithdrawalStatus::Unchained, None).await;

        let ledger = Arc::new(HangingLedger {
            calls: AtomicUsize::new(0),
        });
        let config = ReconcileConfig {
            max_retries: 2,
            retry_delay_ms: 0,
            call_timeout_ms: 5,
        };
        let engine = ReconciliationEngine::new(ledger.clone(), config);
        let (report, stored) = reconcile_and_commit(&engine, &store, id).await;

        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.retries, 2);
        assert_eq!(stored.status, WithdrawalStatus::Exception);
    }
}
