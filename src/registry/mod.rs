//! Subscription state: the durable registry and the merge engine on top of it.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriptionRegistry::new(&config, sdl, counters));
//! let engine = MergeEngine::new(Arc::clone(&registry), config.requestor_id);
//! match engine.on_create(fingerprint, target, details, waiter) {
//!     CreateDecision::Send(transaction) => { /* persist, then send */ }
//!     _ => {}
//! }
//! ```

mod manager;
mod merge;
mod types;

pub use manager::SubscriptionRegistry;
pub use merge::{
    CreateDecision, DeleteDecision, GroupPhase, GroupSummary, MergeEngine, MergeGroup, QueuedOp,
    Resolution,
};
pub use types::{RecoveryReport, Subscription, SCHEMA_VERSION};
