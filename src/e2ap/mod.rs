//! E2AP subscription message codec.
//!
//! Covers the message subset used for the subscription lifecycle and for
//! indication relay:
//! - RIC Subscription Request / Response / Failure
//! - RIC Subscription Delete Request / Response / Failure
//! - RIC Indication
//!
//! # Example
//!
//! ```ignore
//! let bytes = e2ap::pack(&E2apMessage::SubscriptionDeleteRequest(req))?;
//! match e2ap::unpack(&bytes)? {
//!     E2apMessage::SubscriptionDeleteRequest(req) => println!("{}", req.request_id),
//!     other => println!("unexpected {:?}", other.message_type()),
//! }
//! ```

mod codec;
mod types;

pub use codec::{details_bytes, pack, unpack, HEADER_LEN};
pub use types::{
    ActionDefinition, ActionNotAdmitted, ActionType, Cause, CauseGroup, E2apMessage, Indication,
    IndicationType, MessageType, PduKind, ProcedureCode, SubscriptionDeleteFailure,
    SubscriptionDeleteRequest, SubscriptionDeleteResponse, SubscriptionDetails,
    SubscriptionFailure, SubscriptionRequest, SubscriptionResponse, SubsequentAction,
    SubsequentActionKind, MAX_ACTIONS,
};
