//! Binary pack/unpack of E2AP subscription messages.
//!
//! Every message starts with a fixed header:
//!
//! ```text
//! [pdu kind u8][procedure code u8][requestor u32][instance u32][ran function u16][body len u32]
//! ```
//!
//! All integers are big-endian. The body holds the packed target identifier
//! followed by the variant-specific fields. The identifier is variable-length,
//! so it leads the body instead of sitting in the header; this keeps the
//! header a fixed [`HEADER_LEN`] bytes that can be checked before any body
//! parsing. Encoding writes fields in a fixed
//! order from ordered containers, so packing the same value twice yields the
//! same bytes.

use crate::error::{DecodeError, EncodeError};
use crate::identifier::Identifier;
use crate::types::RequestId;

use super::types::{
    ActionDefinition, ActionNotAdmitted, ActionType, Cause, CauseGroup, E2apMessage, Indication,
    IndicationType, MessageType, SubscriptionDeleteFailure, SubscriptionDeleteRequest,
    SubscriptionDeleteResponse, SubscriptionDetails, SubscriptionFailure, SubscriptionRequest,
    SubscriptionResponse, SubsequentAction, SubsequentActionKind, MAX_ACTIONS,
};

/// Fixed header size.
pub const HEADER_LEN: usize = 1 + 1 + 4 + 4 + 2 + 4;

/// Pack a message into its wire form.
pub fn pack(message: &E2apMessage) -> Result<Vec<u8>, EncodeError> {
    let mut body = Writer::default();
    message.target().encode_into(&mut body.buf)?;

    match message {
        E2apMessage::SubscriptionRequest(m) => put_details_body(&mut body, &m.details)?,
        E2apMessage::SubscriptionResponse(m) => {
            body.put_count("admitted actions", m.admitted.len(), MAX_ACTIONS)?;
            for id in &m.admitted {
                body.put_u8(*id);
            }
            put_not_admitted(&mut body, &m.not_admitted)?;
        }
        E2apMessage::SubscriptionFailure(m) => {
            put_cause(&mut body, m.cause);
            put_not_admitted(&mut body, &m.not_admitted)?;
        }
        E2apMessage::SubscriptionDeleteRequest(_) | E2apMessage::SubscriptionDeleteResponse(_) => {}
        E2apMessage::SubscriptionDeleteFailure(m) => put_cause(&mut body, m.cause),
        E2apMessage::Indication(m) => {
            body.put_u8(m.action_id);
            match m.sequence_number {
                Some(sn) => {
                    body.put_u8(1);
                    body.put_u32(sn);
                }
                None => body.put_u8(0),
            }
            body.put_u8(m.indication_type as u8);
            body.put_bytes16("indication header", &m.header)?;
            body.put_bytes32("indication message", &m.message)?;
            match &m.call_process_id {
                Some(cpid) => {
                    body.put_u8(1);
                    body.put_bytes16("call process id", cpid)?;
                }
                None => body.put_u8(0),
            }
        }
    }

    let body = body.buf;
    let body_len = u32::try_from(body.len()).map_err(|_| EncodeError::FieldTooLong {
        field: "body",
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    let (kind, procedure) = message.message_type().tag();
    let request_id = message.request_id();
    let mut out = Writer {
        buf: Vec::with_capacity(HEADER_LEN + body.len()),
    };
    out.put_u8(kind as u8);
    out.put_u8(procedure as u8);
    out.put_u32(request_id.requestor);
    out.put_u32(request_id.instance);
    out.put_u16(message.ran_function_id());
    out.put_u32(body_len);
    out.buf.extend_from_slice(&body);
    Ok(out.buf)
}

/// Unpack a wire message. Never panics; malformed input yields a typed error.
pub fn unpack(bytes: &[u8]) -> Result<E2apMessage, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }

    let mut header = Reader::new(&bytes[..HEADER_LEN]);
    let kind = header.u8()?;
    let procedure = header.u8()?;
    let message_type =
        MessageType::from_tag(kind, procedure).ok_or(DecodeError::UnknownTag { kind, procedure })?;
    let request_id = RequestId::new(header.u32()?, header.u32()?);
    let ran_function_id = header.u16()?;
    let body_len = header.u32()? as usize;

    let body = &bytes[HEADER_LEN..];
    if body.len() < body_len {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN + body_len,
            available: bytes.len(),
        });
    }
    if body.len() > body_len {
        return Err(DecodeError::LengthMismatch {
            declared: body_len,
            actual: body.len(),
        });
    }

    let (target, used) = Identifier::decode_prefix(body)?;
    let mut r = Reader::new(body);
    r.skip(used)?;

    let message = match message_type {
        MessageType::SubscriptionRequest => {
            let details = read_details_body(&mut r, ran_function_id)?;
            E2apMessage::SubscriptionRequest(SubscriptionRequest {
                request_id,
                target,
                details,
            })
        }
        MessageType::SubscriptionResponse => {
            let count = r.count("admitted actions", MAX_ACTIONS)?;
            let mut admitted = Vec::with_capacity(count);
            for _ in 0..count {
                admitted.push(r.u8()?);
            }
            let not_admitted = read_not_admitted(&mut r)?;
            E2apMessage::SubscriptionResponse(SubscriptionResponse {
                request_id,
                ran_function_id,
                target,
                admitted,
                not_admitted,
            })
        }
        MessageType::SubscriptionFailure => {
            let cause = read_cause(&mut r)?;
            let not_admitted = read_not_admitted(&mut r)?;
            E2apMessage::SubscriptionFailure(SubscriptionFailure {
                request_id,
                ran_function_id,
                target,
                cause,
                not_admitted,
            })
        }
        MessageType::SubscriptionDeleteRequest => {
            E2apMessage::SubscriptionDeleteRequest(SubscriptionDeleteRequest {
                request_id,
                ran_function_id,
                target,
            })
        }
        MessageType::SubscriptionDeleteResponse => {
            E2apMessage::SubscriptionDeleteResponse(SubscriptionDeleteResponse {
                request_id,
                ran_function_id,
                target,
            })
        }
        MessageType::SubscriptionDeleteFailure => {
            let cause = read_cause(&mut r)?;
            E2apMessage::SubscriptionDeleteFailure(SubscriptionDeleteFailure {
                request_id,
                ran_function_id,
                target,
                cause,
            })
        }
        MessageType::Indication => {
            let action_id = r.u8()?;
            let sequence_number = if r.flag("sequence number present")? {
                Some(r.u32()?)
            } else {
                None
            };
            let indication_type = match r.u8()? {
                0 => IndicationType::Report,
                1 => IndicationType::Insert,
                v => {
                    return Err(DecodeError::InvalidValue {
                        field: "indication type",
                        value: v as u32,
                    })
                }
            };
            let header = r.bytes16()?.to_vec();
            let message = r.bytes32()?.to_vec();
            let call_process_id = if r.flag("call process id present")? {
                Some(r.bytes16()?.to_vec())
            } else {
                None
            };
            E2apMessage::Indication(Indication {
                request_id,
                ran_function_id,
                target,
                action_id,
                sequence_number,
                indication_type,
                header,
                message,
                call_process_id,
            })
        }
    };

    r.finish()?;
    Ok(message)
}

/// Canonical bytes of a subscription's functional content, used for fingerprinting.
pub fn details_bytes(target: &Identifier, details: &SubscriptionDetails) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::default();
    target.encode_into(&mut w.buf)?;
    w.put_u16(details.ran_function_id);
    put_details_body(&mut w, details)?;
    Ok(w.buf)
}

fn put_details_body(w: &mut Writer, details: &SubscriptionDetails) -> Result<(), EncodeError> {
    w.put_bytes16("event trigger", &details.event_trigger)?;

    if details.actions.is_empty() {
        return Err(EncodeError::Empty("actions"));
    }
    w.put_count("actions", details.actions.len(), MAX_ACTIONS)?;
    let mut seen = [false; 256];
    for action in &details.actions {
        if std::mem::replace(&mut seen[action.action_id as usize], true) {
            return Err(EncodeError::DuplicateAction(action.action_id));
        }
        w.put_u8(action.action_id);
        w.put_u8(action.action_type as u8);
        w.put_bytes16("action definition", &action.definition)?;
        match action.subsequent {
            Some(sub) => {
                w.put_u8(1);
                w.put_u8(sub.kind as u8);
                w.put_u8(sub.time_to_wait);
            }
            None => w.put_u8(0),
        }
    }
    Ok(())
}

fn read_details_body(r: &mut Reader<'_>, ran_function_id: u16) -> Result<SubscriptionDetails, DecodeError> {
    let event_trigger = r.bytes16()?.to_vec();

    let count = r.count("actions", MAX_ACTIONS)?;
    if count == 0 {
        return Err(DecodeError::InvalidValue {
            field: "action count",
            value: 0,
        });
    }
    let mut actions = Vec::with_capacity(count);
    let mut seen = [false; 256];
    for _ in 0..count {
        let action_id = r.u8()?;
        if std::mem::replace(&mut seen[action_id as usize], true) {
            return Err(DecodeError::InvalidValue {
                field: "action id",
                value: action_id as u32,
            });
        }
        let action_type = match r.u8()? {
            0 => ActionType::Report,
            1 => ActionType::Insert,
            2 => ActionType::Policy,
            v => {
                return Err(DecodeError::InvalidValue {
                    field: "action type",
                    value: v as u32,
                })
            }
        };
        let definition = r.bytes16()?.to_vec();
        let subsequent = if r.flag("subsequent action present")? {
            let kind = match r.u8()? {
                0 => SubsequentActionKind::Continue,
                1 => SubsequentActionKind::Wait,
                v => {
                    return Err(DecodeError::InvalidValue {
                        field: "subsequent action type",
                        value: v as u32,
                    })
                }
            };
            Some(SubsequentAction {
                kind,
                time_to_wait: r.u8()?,
            })
        } else {
            None
        };
        actions.push(ActionDefinition {
            action_id,
            action_type,
            definition,
            subsequent,
        });
    }

    Ok(SubscriptionDetails {
        ran_function_id,
        event_trigger,
        actions,
    })
}

fn put_cause(w: &mut Writer, cause: Cause) {
    w.put_u8(cause.group as u8);
    w.put_u8(cause.value);
}

fn read_cause(r: &mut Reader<'_>) -> Result<Cause, DecodeError> {
    let group = match r.u8()? {
        0 => CauseGroup::RicRequest,
        1 => CauseGroup::RicService,
        2 => CauseGroup::Transport,
        3 => CauseGroup::Protocol,
        4 => CauseGroup::Misc,
        v => {
            return Err(DecodeError::InvalidValue {
                field: "cause group",
                value: v as u32,
            })
        }
    };
    Ok(Cause::new(group, r.u8()?))
}

fn put_not_admitted(w: &mut Writer, list: &[ActionNotAdmitted]) -> Result<(), EncodeError> {
    w.put_count("not admitted actions", list.len(), MAX_ACTIONS)?;
    for item in list {
        w.put_u8(item.action_id);
        put_cause(w, item.cause);
    }
    Ok(())
}

fn read_not_admitted(r: &mut Reader<'_>) -> Result<Vec<ActionNotAdmitted>, DecodeError> {
    let count = r.count("not admitted actions", MAX_ACTIONS)?;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        let action_id = r.u8()?;
        let cause = read_cause(r)?;
        list.push(ActionNotAdmitted { action_id, cause });
    }
    Ok(list)
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_count(&mut self, field: &'static str, count: usize, max: usize) -> Result<(), EncodeError> {
        if count > max {
            return Err(EncodeError::TooManyItems { field, count, max });
        }
        self.put_u8(count as u8);
        Ok(())
    }

    fn put_bytes16(&mut self, field: &'static str, data: &[u8]) -> Result<(), EncodeError> {
        let len = u16::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong {
            field,
            len: data.len(),
            max: u16::MAX as usize,
        })?;
        self.put_u16(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn put_bytes32(&mut self, field: &'static str, data: &[u8]) -> Result<(), EncodeError> {
        let len = u32::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong {
            field,
            len: data.len(),
            max: u32::MAX as usize,
        })?;
        self.put_u32(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

/// Bounds-checked cursor over a message body. Overruns are length mismatches:
/// the body length was already checked against the buffer, so an inner field
/// reaching past it contradicts the declared lengths.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(DecodeError::LengthMismatch {
                declared: n,
                actual: remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(DecodeError::InvalidValue {
                field,
                value: v as u32,
            }),
        }
    }

    fn count(&mut self, field: &'static str, max: usize) -> Result<usize, DecodeError> {
        let count = self.u8()? as usize;
        if count > max {
            return Err(DecodeError::InvalidValue {
                field,
                value: count as u32,
            });
        }
        Ok(count)
    }

    fn bytes16(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn bytes32(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos != self.buf.len() {
            return Err(DecodeError::LengthMismatch {
                declared: self.pos,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }
}
