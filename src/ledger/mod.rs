pub mod ethereum;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use ethereum::{EthereumLedger, WEI_DECIMALS};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ethereum RPC error: {0}")]
    Rpc(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid ledger reference: {0}")]
    InvalidReference(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Ledger call timed out after {0:?}")]
    Timeout(Duration),
}

/// What the ledger currently says about a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// No receipt yet.
    NotYetObserved,
    Success,
    Failure,
    /// A receipt whose status is neither 1 nor 0, or carries no status at all.
    Unrecognized(Option<u64>),
}

impl LedgerOutcome {
    /// Maps the status field of a mined receipt (1 success, 0 reverted).
    pub fn from_receipt_status(status: Option<u64>) -> Self {
        match status {
            Some(1) => LedgerOutcome::Success,
            Some(0) => LedgerOutcome::Failure,
            other => LedgerOutcome::Unrecognized(other),
        }
    }
}

/// Custodial access to the external ledger.
///
/// Source and destination accounts are fixed when the client is built, a transfer
/// only names the amount. Implementations report every failure and never retry on
/// their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Signs and broadcasts a value transfer, returning its transaction reference.
    async fn submit_transfer(&self, amount: Decimal) -> Result<String, LedgerError>;

    async fn transaction_outcome(&self, tx_ref: &str) -> Result<LedgerOutcome, LedgerError>;

    /// Balance of `address` in ether.
    async fn balance_of(&self, address: &str) -> Result<Decimal, LedgerError>;

    fn custodial_address(&self) -> String;
}

/// Bounds a ledger call, expiry is reported as [`LedgerError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| LedgerError::Timeout(limit))?
}
