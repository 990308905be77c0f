//! Transaction and requester-facing outcome types.

use crate::e2ap::Cause;
use crate::transport::RoutedMessage;
use crate::types::{Fingerprint, InstanceId, RequestId, RequesterRef, Timestamp};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::time::{Duration, Instant};

/// Direction of a downstream request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Create,
    Delete,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Create => write!(f, "create"),
            TransactionKind::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle of a transaction. Only `Pending` transactions are tracked;
/// the terminal states are stamped on the value handed back on resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Resolved,
    Expired,
}

/// One outstanding downstream request/response cycle.
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Correlation id.
    pub id: RequestId,
    pub fingerprint: Fingerprint,
    pub kind: TransactionKind,
    /// Requester whose request triggered the send; `None` for internal
    /// clean-up deletes.
    pub requester: Option<RequesterRef>,
    pub state: TransactionState,
    /// Wire message, kept for re-sends.
    pub message: RoutedMessage,
    pub deadline: Instant,
    pub retry_count: u32,
    pub started: Timestamp,
}

impl Transaction {
    pub fn new(
        fingerprint: Fingerprint,
        kind: TransactionKind,
        requester: Option<RequesterRef>,
        message: RoutedMessage,
    ) -> Self {
        Self {
            id: message.request_id,
            fingerprint,
            kind,
            requester,
            state: TransactionState::Pending,
            message,
            deadline: Instant::now(),
            retry_count: 0,
            started: Timestamp::now(),
        }
    }
}

/// Why a request failed, as reported to the requester.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureCause {
    /// No downstream response within the retry budget.
    Timeout { attempts: u32 },
    /// The RAN node refused the request.
    Rejected(Cause),
    /// The requester holds no subscription with that instance id.
    UnknownSubscription,
    /// The request could not be encoded.
    Encode(String),
    /// Local resource or bookkeeping failure.
    Internal(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Timeout { attempts } => write!(f, "timeout after {} attempts", attempts),
            FailureCause::Rejected(cause) => write!(f, "rejected: {:?}/{}", cause.group, cause.value),
            FailureCause::UnknownSubscription => write!(f, "unknown subscription"),
            FailureCause::Encode(e) => write!(f, "encode error: {}", e),
            FailureCause::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

/// The single response a requester receives for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { instance_id: InstanceId },
    Failure { cause: FailureCause },
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            RequestOutcome::Success { instance_id } => Some(*instance_id),
            RequestOutcome::Failure { .. } => None,
        }
    }
}

/// A requester waiting for the outcome of its request.
pub struct Waiter {
    pub requester: RequesterRef,
    pub idempotency_key: Option<String>,
    reply: Sender<RequestOutcome>,
}

impl Waiter {
    /// Create a waiter and the handle its outcome is delivered on.
    pub fn new(requester: RequesterRef, idempotency_key: Option<String>) -> (Self, ResponseHandle) {
        let (reply, receiver) = crossbeam_channel::bounded(1);
        let waiter = Self {
            requester,
            idempotency_key,
            reply,
        };
        (waiter, ResponseHandle { receiver })
    }

    /// Deliver the outcome. Consumes the waiter, so each request is
    /// answered at most once.
    pub fn reply(self, outcome: RequestOutcome) {
        // A dropped handle means the requester stopped listening.
        let _ = self.reply.try_send(outcome);
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("requester", &self.requester)
            .field("idempotency_key", &self.idempotency_key)
            .finish()
    }
}

/// Handle on which a requester receives the outcome of its request.
pub struct ResponseHandle {
    receiver: Receiver<RequestOutcome>,
}

impl ResponseHandle {
    /// Wait for the outcome (blocking).
    pub fn recv(&self) -> Result<RequestOutcome, RecvError> {
        self.receiver.recv()
    }

    /// Poll for the outcome (non-blocking).
    pub fn try_recv(&self) -> Result<RequestOutcome, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<RequestOutcome, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
