//! States, events and the pure transition rules of the reconciliation state machine.
//!
//! Side effects live in the engine. Everything here is deterministic and checked on
//! its own.

use crate::ledger::{LedgerError, LedgerOutcome};
use crate::models::{Withdrawal, WithdrawalStatus};

/// Drives the state machine forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Broadcast a (new) transaction.
    Start,
    /// Poll the outcome of the current ledger reference.
    Check,
    Retry,
    MaxRetriesReached,
    Succeeded,
}

/// First event of an invocation, `None` when the withdrawal is settled.
///
/// A withdrawal carrying a ledger reference is always polled first: nothing is
/// broadcast again until the previous transaction's outcome has been looked at.
pub fn entry_event(withdrawal: &Withdrawal) -> Option<Event> {
    if withdrawal.is_settled() {
        None
    } else if withdrawal.ledger_tx_ref.is_some() {
        Some(Event::Check)
    } else {
        Some(Event::Start)
    }
}

/// Where a retry resumes: an in-flight transaction is polled again, anything else
/// is resubmitted.
pub fn resume_event(state: WithdrawalStatus) -> Event {
    if state == WithdrawalStatus::Pending {
        Event::Check
    } else {
        Event::Start
    }
}

/// Status written when retries run out. Only a withdrawal that never got a
/// transaction accepted is forced to `Exception`, otherwise the last observation stands.
pub fn exhausted_status(state: WithdrawalStatus) -> Option<WithdrawalStatus> {
    match state {
        WithdrawalStatus::Unchained => Some(WithdrawalStatus::Exception),
        _ => None,
    }
}

/// What polling the ledger produced.
#[derive(Debug)]
pub enum Observation {
    NotYetObserved,
    Confirmed,
    LedgerOutcomeFailure,
    LedgerOutcomeUnrecognized(Option<u64>),
    /// The poll itself failed or timed out.
    LedgerTransient(LedgerError),
}

impl From<Result<LedgerOutcome, LedgerError>> for Observation {
    fn from(result: Result<LedgerOutcome, LedgerError>) -> Self {
        match result {
            Ok(LedgerOutcome::NotYetObserved) => Observation::NotYetObserved,
            Ok(LedgerOutcome::Success) => Observation::Confirmed,
            Ok(LedgerOutcome::Failure) => Observation::LedgerOutcomeFailure,
            Ok(LedgerOutcome::Unrecognized(code)) => Observation::LedgerOutcomeUnrecognized(code),
            Err(e) => Observation::LedgerTransient(e),
        }
    }
}

/// Result of applying one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub state: WithdrawalStatus,
    /// Whether `state` is a fact about the ledger that belongs in the store.
    pub record: bool,
    pub next: Event,
}

pub fn on_observation(observation: &Observation) -> Step {
    match observation {
        Observation::NotYetObserved => Step {
            state: WithdrawalStatus::Pending,
            record: true,
            next: Event::Retry,
        },
        Observation::Confirmed => Step {
            state: WithdrawalStatus::Success,
            record: true,
            next: Event::Succeeded,
        },
        Observation::LedgerOutcomeFailure => Step {
            state: WithdrawalStatus::Failure,
            record: true,
            next: Event::Retry,
        },
        Observation::LedgerOutcomeUnrecognized(_) => Step {
            state: WithdrawalStatus::Exception,
            record: true,
            next: Event::Retry,
        },
        // keep polling the same reference, the stored status is left alone
        Observation::LedgerTransient(_) => Step {
            state: WithdrawalStatus::Pending,
            record: false,
            next: Event::Retry,
        },
    }
}

/// Retry slots of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    /// Takes one slot, `false` once the budget is spent.
    pub fn consume(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}
