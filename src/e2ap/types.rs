//! E2AP subscription message types.

use crate::identifier::Identifier;
use crate::types::RequestId;

/// Maximum number of actions in one subscription (maxofRICactionID).
pub const MAX_ACTIONS: usize = 16;

/// E2AP PDU kind (the CHOICE of the outermost PDU).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PduKind {
    InitiatingMessage = 0,
    SuccessfulOutcome = 1,
    UnsuccessfulOutcome = 2,
}

/// E2AP elementary procedure codes used here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcedureCode {
    RicIndication = 5,
    RicSubscription = 8,
    RicSubscriptionDelete = 9,
}

/// Message variants understood by the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    SubscriptionRequest,
    SubscriptionResponse,
    SubscriptionFailure,
    SubscriptionDeleteRequest,
    SubscriptionDeleteResponse,
    SubscriptionDeleteFailure,
    Indication,
}

impl MessageType {
    /// Wire tag: PDU kind and procedure code.
    pub fn tag(self) -> (PduKind, ProcedureCode) {
        use PduKind::*;
        use ProcedureCode::*;
        match self {
            MessageType::SubscriptionRequest => (InitiatingMessage, RicSubscription),
            MessageType::SubscriptionResponse => (SuccessfulOutcome, RicSubscription),
            MessageType::SubscriptionFailure => (UnsuccessfulOutcome, RicSubscription),
            MessageType::SubscriptionDeleteRequest => (InitiatingMessage, RicSubscriptionDelete),
            MessageType::SubscriptionDeleteResponse => (SuccessfulOutcome, RicSubscriptionDelete),
            MessageType::SubscriptionDeleteFailure => {
                (UnsuccessfulOutcome, RicSubscriptionDelete)
            }
            MessageType::Indication => (InitiatingMessage, RicIndication),
        }
    }

    /// Inverse of [`MessageType::tag`] on raw bytes.
    pub fn from_tag(kind: u8, procedure: u8) -> Option<Self> {
        let t = match (kind, procedure) {
            (0, 8) => MessageType::SubscriptionRequest,
            (1, 8) => MessageType::SubscriptionResponse,
            (2, 8) => MessageType::SubscriptionFailure,
            (0, 9) => MessageType::SubscriptionDeleteRequest,
            (1, 9) => MessageType::SubscriptionDeleteResponse,
            (2, 9) => MessageType::SubscriptionDeleteFailure,
            (0, 5) => MessageType::Indication,
            _ => return None,
        };
        Some(t)
    }

    /// Message bus type number used to route this message.
    pub fn mtype(self) -> u32 {
        match self {
            MessageType::SubscriptionRequest => 12010,
            MessageType::SubscriptionResponse => 12011,
            MessageType::SubscriptionFailure => 12012,
            MessageType::SubscriptionDeleteRequest => 12020,
            MessageType::SubscriptionDeleteResponse => 12021,
            MessageType::SubscriptionDeleteFailure => 12022,
            MessageType::Indication => 12050,
        }
    }
}

/// RIC action type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Report = 0,
    Insert = 1,
    Policy = 2,
}

/// What the node does after an action has run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsequentActionKind {
    Continue = 0,
    Wait = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SubsequentAction {
    pub kind: SubsequentActionKind,
    /// Enumerated RICtimeToWait value.
    pub time_to_wait: u8,
}

/// One action of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ActionDefinition {
    pub action_id: u8,
    pub action_type: ActionType,
    #[serde(default)]
    pub definition: Vec<u8>,
    #[serde(default)]
    pub subsequent: Option<SubsequentAction>,
}

impl ActionDefinition {
    pub fn report(action_id: u8, definition: impl Into<Vec<u8>>) -> Self {
        Self {
            action_id,
            action_type: ActionType::Report,
            definition: definition.into(),
            subsequent: None,
        }
    }
}

/// The functional content of a subscription: what two requests must share to be merged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SubscriptionDetails {
    pub ran_function_id: u16,
    /// Event trigger definition (report style).
    pub event_trigger: Vec<u8>,
    pub actions: Vec<ActionDefinition>,
}

/// Cause groups of the E2AP Cause CHOICE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseGroup {
    RicRequest = 0,
    RicService = 1,
    Transport = 2,
    Protocol = 3,
    Misc = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Cause {
    pub group: CauseGroup,
    pub value: u8,
}

impl Cause {
    pub fn new(group: CauseGroup, value: u8) -> Self {
        Self { group, value }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionNotAdmitted {
    pub action_id: u8,
    pub cause: Cause,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub request_id: RequestId,
    pub target: Identifier,
    pub details: SubscriptionDetails,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionResponse {
    pub request_id: RequestId,
    pub ran_function_id: u16,
    pub target: Identifier,
    pub admitted: Vec<u8>,
    pub not_admitted: Vec<ActionNotAdmitted>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionFailure {
    pub request_id: RequestId,
    pub ran_function_id: u16,
    pub target: Identifier,
    pub cause: Cause,
    pub not_admitted: Vec<ActionNotAdmitted>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionDeleteRequest {
    pub request_id: RequestId,
    pub ran_function_id: u16,
    pub target: Identifier,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionDeleteResponse {
    pub request_id: RequestId,
    pub ran_function_id: u16,
    pub target: Identifier,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionDeleteFailure {
    pub request_id: RequestId,
    pub ran_function_id: u16,
    pub target: Identifier,
    pub cause: Cause,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndicationType {
    Report = 0,
    Insert = 1,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Indication {
    pub request_id: RequestId,
    pub ran_function_id: u16,
    pub target: Identifier,
    pub action_id: u8,
    pub sequence_number: Option<u32>,
    pub indication_type: IndicationType,
    pub header: Vec<u8>,
    pub message: Vec<u8>,
    pub call_process_id: Option<Vec<u8>>,
}

/// Any message the codec can pack or unpack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum E2apMessage {
    SubscriptionRequest(SubscriptionRequest),
    SubscriptionResponse(SubscriptionResponse),
    SubscriptionFailure(SubscriptionFailure),
    SubscriptionDeleteRequest(SubscriptionDeleteRequest),
    SubscriptionDeleteResponse(SubscriptionDeleteResponse),
    SubscriptionDeleteFailure(SubscriptionDeleteFailure),
    Indication(Indication),
}

impl E2apMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            E2apMessage::SubscriptionRequest(_) => MessageType::SubscriptionRequest,
            E2apMessage::SubscriptionResponse(_) => MessageType::SubscriptionResponse,
            E2apMessage::SubscriptionFailure(_) => MessageType::SubscriptionFailure,
            E2apMessage::SubscriptionDeleteRequest(_) => MessageType::SubscriptionDeleteRequest,
            E2apMessage::SubscriptionDeleteResponse(_) => MessageType::SubscriptionDeleteResponse,
            E2apMessage::SubscriptionDeleteFailure(_) => MessageType::SubscriptionDeleteFailure,
            E2apMessage::Indication(_) => MessageType::Indication,
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            E2apMessage::SubscriptionRequest(m) => m.request_id,
            E2apMessage::SubscriptionResponse(m) => m.request_id,
            E2apMessage::SubscriptionFailure(m) => m.request_id,
            E2apMessage::SubscriptionDeleteRequest(m) => m.request_id,
            E2apMessage::SubscriptionDeleteResponse(m) => m.request_id,
            E2apMessage::SubscriptionDeleteFailure(m) => m.request_id,
            E2apMessage::Indication(m) => m.request_id,
        }
    }

    pub fn ran_function_id(&self) -> u16 {
        match self {
            E2apMessage::SubscriptionRequest(m) => m.details.ran_function_id,
            E2apMessage::SubscriptionResponse(m) => m.ran_function_id,
            E2apMessage::SubscriptionFailure(m) => m.ran_function_id,
            E2apMessage::SubscriptionDeleteRequest(m) => m.ran_function_id,
            E2apMessage::SubscriptionDeleteResponse(m) => m.ran_function_id,
            E2apMessage::SubscriptionDeleteFailure(m) => m.ran_function_id,
            E2apMessage::Indication(m) => m.ran_function_id,
        }
    }

    pub fn target(&self) -> &Identifier {
        match self {
            E2apMessage::SubscriptionRequest(m) => &m.target,
            E2apMessage::SubscriptionResponse(m) => &m.target,
            E2apMessage::SubscriptionFailure(m) => &m.target,
            E2apMessage::SubscriptionDeleteRequest(m) => &m.target,
            E2apMessage::SubscriptionDeleteResponse(m) => &m.target,
            E2apMessage::SubscriptionDeleteFailure(m) => &m.target,
            E2apMessage::Indication(m) => &m.target,
        }
    }
}
