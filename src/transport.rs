//! Downstream transport boundary toward E2Term.

use crate::e2ap::{self, E2apMessage};
use crate::error::{Result, SubmgrError};
use crate::identifier::Identifier;
use crate::types::RequestId;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// A packed E2AP message addressed to a RAN node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedMessage {
    /// Message bus type number.
    pub mtype: u32,
    pub request_id: RequestId,
    /// Node the message is routed to.
    pub target: Identifier,
    pub payload: Vec<u8>,
}

impl RoutedMessage {
    /// Pack `message` and address it to its target node.
    pub fn from_message(message: &E2apMessage) -> Result<Self> {
        Ok(Self {
            mtype: message.message_type().mtype(),
            request_id: message.request_id(),
            target: message.target().clone(),
            payload: e2ap::pack(message)?,
        })
    }

    /// Unpack the payload.
    pub fn decode(&self) -> Result<E2apMessage> {
        Ok(e2ap::unpack(&self.payload)?)
    }
}

/// Sends messages toward E2Term. Implementations may block on I/O; the
/// controller never calls them while holding subscription state locks.
pub trait E2TermSender: Send + Sync {
    fn send(&self, message: &RoutedMessage) -> Result<()>;
}

/// Sender that hands messages to an in-process channel.
pub struct ChannelSender {
    tx: Sender<RoutedMessage>,
}

impl ChannelSender {
    pub fn new() -> (Self, Receiver<RoutedMessage>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl E2TermSender for ChannelSender {
    fn send(&self, message: &RoutedMessage) -> Result<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| SubmgrError::Route(format!("no route for {}", message.target)))
    }
}
