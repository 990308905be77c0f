//! Error types for the subscription manager.

use crate::types::{InstanceId, RequestId};
use std::fmt;
use thiserror::Error;

/// A packed identifier that could not be encoded or decoded.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("Invalid digit nibble {nibble:#x} at position {position}")]
    InvalidDigit { position: usize, nibble: u8 },

    #[error("Invalid digit character {0:?}")]
    InvalidDigitChar(char),

    #[error("Digit count {digits} needs {expected} bytes, got {actual}")]
    LengthMismatch {
        digits: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported PLMN digit count: {0}")]
    UnsupportedDigitCount(usize),

    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("Trailing bytes after identifier: {0}")]
    TrailingBytes(usize),

    #[error("Cannot parse identifier: {0}")]
    Parse(String),
}

/// Failure to build the wire form of a message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("Too many {field}: {count} (max {max})")]
    TooManyItems {
        field: &'static str,
        count: usize,
        max: usize,
    },

    #[error("Field {field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Field {0} must not be empty")]
    Empty(&'static str),

    #[error("Duplicate action id {0}")]
    DuplicateAction(u8),

    #[error("Identifier error: {0}")]
    Identifier(#[from] IdentifierError),
}

/// Failure to parse a wire message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown message tag: kind {kind}, procedure {procedure}")]
    UnknownTag { kind: u8, procedure: u8 },

    #[error("Length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(#[from] IdentifierError),
}

impl DecodeError {
    /// Coarse class of the malformation, stable for a given input class.
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            DecodeError::Truncated { .. } => DecodeErrorKind::Truncated,
            DecodeError::UnknownTag { .. } => DecodeErrorKind::UnknownTag,
            DecodeError::LengthMismatch { .. } => DecodeErrorKind::LengthMismatch,
            DecodeError::InvalidValue { .. } => DecodeErrorKind::InvalidValue,
            DecodeError::MalformedIdentifier(_) => DecodeErrorKind::MalformedIdentifier,
        }
    }
}

/// See [`DecodeError::kind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    Truncated,
    UnknownTag,
    LengthMismatch,
    InvalidValue,
    MalformedIdentifier,
}

/// Persistence gateway operation class, used for failure accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PersistenceOp {
    Write,
    Read,
    Remove,
}

impl fmt::Display for PersistenceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceOp::Write => write!(f, "write"),
            PersistenceOp::Read => write!(f, "read"),
            PersistenceOp::Remove => write!(f, "remove"),
        }
    }
}

/// Error raised by a persistence gateway implementation.
#[derive(Debug, Error)]
#[error("SDL {op} failed: {reason}")]
pub struct SdlError {
    pub op: PersistenceOp,
    pub reason: String,
}

impl SdlError {
    pub fn new(op: PersistenceOp, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

/// Main error type for subscription manager operations.
#[derive(Debug, Error)]
pub enum SubmgrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(#[from] IdentifierError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transaction already in flight: {0}")]
    DuplicateTransaction(RequestId),

    #[error("Downstream timeout for {request_id} after {attempts} attempts")]
    DownstreamTimeout {
        request_id: RequestId,
        attempts: u32,
    },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] SdlError),

    #[error("Registry corruption in record {key}: {reason}")]
    RegistryCorruption { key: String, reason: String },

    #[error("Route failure: {0}")]
    Route(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(InstanceId),

    #[error("No free instance ids")]
    InstanceIdsExhausted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for SubmgrError {
    fn from(e: serde_json::Error) -> Self {
        SubmgrError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SubmgrError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubmgrError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubmgrError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubmgrError::Deserialization(e.to_string())
    }
}

/// Result type for subscription manager operations.
pub type Result<T> = std::result::Result<T, SubmgrError>;
