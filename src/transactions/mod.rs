//! Downstream transactions and duplicate request detection.
//!
//! - [`TransactionTracker`] owns every outstanding request/response cycle
//!   and resolves each exactly once.
//! - [`DuplicateDetector`] folds requests that race for the same outcome
//!   into one pending transaction.

mod duplicate;
mod tracker;
mod types;

pub use duplicate::{DuplicateDetector, Registration};
pub use tracker::{TimeoutOutcome, TransactionTracker};
pub use types::{
    FailureCause, RequestOutcome, ResponseHandle, Transaction, TransactionKind, TransactionState,
    Waiter,
};
