#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use mockall::mock;
use quorum_withdrawal::api::routes::{create_router, AppState};
use quorum_withdrawal::config::{
    AppConfig, DatabaseConfig, LedgerConfig, LoggingConfig, QuorumConfig, ReconcileConfig,
    ServerConfig,
};
use quorum_withdrawal::db::{MemoryStore, UnitOfWork, WithdrawalStore};
use quorum_withdrawal::ledger::{LedgerClient, LedgerError, LedgerOutcome};
use quorum_withdrawal::service::WithdrawalService;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

mock! {
    pub Ledger {}

    #[async_trait]
    impl LedgerClient for Ledger {
        async fn submit_transfer(&self, amount: Decimal) -> Result<String, LedgerError>;
        async fn transaction_outcome(&self, tx_ref: &str) -> Result<LedgerOutcome, LedgerError>;
        async fn balance_of(&self, address: &str) -> Result<Decimal, LedgerError>;
        fn custodial_address(&self) -> String;
    }
}

/// Lets the balance lookup done after each execute go through.
pub fn allow_balance_lookup(ledger: &mut MockLedger) {
    ledger
        .expect_custodial_address()
        .returning(|| "0x00000000000000000000000000000000000000aa".to_string());
    ledger
        .expect_balance_of()
        .returning(|_| Ok(Decimal::new(42, 0)));
}

pub fn tx_hash(n: usize) -> String {
    format!("0x{:064x}", n)
}

// Helper function to create test config
pub fn create_test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: DatabaseConfig { max_connections: 5 },
        ledger: LedgerConfig {
            destination_address: "0x23AC5dEDa8a5C6D9b4721b05E7882bE718E5C07d".to_string(),
            connect_attempts: 1,
        },
        reconcile: ReconcileConfig {
            max_retries: 3,
            retry_delay_ms: 0,
            call_timeout_ms: 1_000,
        },
        quorum: QuorumConfig { threshold: 2 },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
    }
}

pub fn create_test_service(
    store: &MemoryStore,
    ledger: Arc<dyn LedgerClient>,
) -> WithdrawalService {
    WithdrawalService::new(Arc::new(store.clone()), ledger, &create_test_config())
}

pub fn create_test_app(store: &MemoryStore, ledger: Arc<dyn LedgerClient>) -> Router {
    let state = Arc::new(AppState {
        service: create_test_service(store, ledger),
        config: create_test_config(),
    });

    create_router(state)
}

/// Sends one request through the router and decodes the JSON body.
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };

    (status, parsed)
}

/// Creates a withdrawal and records `approvers` directly in the store, bypassing the
/// auto-triggered reconciliation.
pub async fn seed_approved_withdrawal(store: &MemoryStore, approvers: &[i64]) -> i64 {
    let withdrawal = store.create_withdrawal(Decimal::ONE).await.unwrap();
    let (_, mut unit) = store.lock_withdrawal(withdrawal.id).await.unwrap();
    for approver_id in approvers {
        unit.insert_approval(*approver_id).await.unwrap();
    }
    unit.commit().await.unwrap();
    withdrawal.id
}

/// Ledger that answers every poll with the same outcome after a delay, counting calls.
pub struct CountingLedger {
    pub submissions: AtomicUsize,
    pub polls: AtomicUsize,
    outcome: LedgerOutcome,
    delay: Duration,
}

impl CountingLedger {
    pub fn new(outcome: LedgerOutcome, delay: Duration) -> Self {
        Self {
            submissions: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            outcome,
            delay,
        }
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for CountingLedger {
    async fn submit_transfer(&self, _amount: Decimal) -> Result<String, LedgerError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(tx_hash(n))
    }

    async fn transaction_outcome(&self, _tx_ref: &str) -> Result<LedgerOutcome, LedgerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.outcome)
    }

    async fn balance_of(&self, _address: &str) -> Result<Decimal, LedgerError> {
        Ok(Decimal::ZERO)
    }

    fn custodial_address(&self) -> String {
        "0x00000000000000000000000000000000000000aa".to_string()
    }
}
