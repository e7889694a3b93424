//! Reconciliation of a withdrawal against the external ledger.

pub mod engine;
pub mod state;

pub use engine::{ReconcileError, ReconcileOutcome, ReconcileReport, ReconciliationEngine};
