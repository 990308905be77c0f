//! # Submgr
//!
//! An E2 subscription manager: it sits between client applications (xApps)
//! and the RAN-facing E2 termination, merging functionally identical
//! subscription requests into one downstream subscription.
//!
//! ## Core Concepts
//!
//! - **Identifiers**: PLMN digits BCD-packed with a local node id
//! - **E2AP codec**: binary subscription, delete and indication messages
//! - **Merge groups**: one downstream subscription shared by every requester
//!   asking for the same thing, reference counted by member
//! - **Transactions**: request/response cycles with timer-driven re-sends,
//!   resolved exactly once
//! - **Registry**: write-through subscription records that survive restarts
//!
//! ## Example
//!
//! ```ignore
//! use submgr::{ChannelSender, Controller, Counters, FileSdl, SubmgrConfig, SubscribeRequest};
//!
//! let (sender, downstream) = ChannelSender::new();
//! let controller = Controller::new(
//!     SubmgrConfig::from_json_file("submgr.json")?,
//!     Arc::new(FileSdl::open("./submgr-data")?),
//!     Arc::new(sender),
//!     Arc::new(Counters::new()),
//! )?;
//! controller.recover()?;
//! let _events = controller.start()?;
//!
//! let handle = controller.subscribe(request);
//! ```

pub mod config;
pub mod control;
pub mod e2ap;
pub mod error;
pub mod identifier;
pub mod metrics;
pub mod registry;
pub mod sdl;
pub mod timer;
pub mod transactions;
pub mod transport;
pub mod types;

// Re-exports
pub use config::SubmgrConfig;
pub use control::{Controller, EventLoop, InboundOutcome, SubscribeRequest, UnsubscribeRequest};
pub use e2ap::{ActionDefinition, E2apMessage, SubscriptionDetails};
pub use error::{
    DecodeError, DecodeErrorKind, EncodeError, IdentifierError, PersistenceOp, Result, SdlError,
    SubmgrError,
};
pub use identifier::{Identifier, PlmnIdentity};
pub use metrics::{Counter, Counters};
pub use registry::{
    GroupPhase, GroupSummary, MergeEngine, RecoveryReport, Subscription, SubscriptionRegistry,
};
pub use sdl::{FileSdl, MemorySdl, PersistenceGateway};
pub use timer::{TimerEvent, TimerManager};
pub use transactions::{FailureCause, RequestOutcome, ResponseHandle, TransactionKind};
pub use transport::{ChannelSender, E2TermSender, RoutedMessage};
pub use types::*;
