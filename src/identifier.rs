//! Packed-decimal encoding of network node identifiers.
//!
//! A node is identified by its PLMN (mobile country code plus mobile network
//! code) and a local node id. PLMN digits are BCD-packed two per byte, the
//! more significant digit in the high nibble. An odd digit count is padded
//! with [`FILLER_NIBBLE`] in the low nibble of the final byte.
//!
//! Wire layout:
//!
//! ```text
//! [digit count u8][ceil(n/2) BCD bytes][node id len u8][node id bytes]
//! ```

use crate::error::IdentifierError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Nibble value padding an odd-length digit string.
pub const FILLER_NIBBLE: u8 = 0x0F;

/// Maximum node id length in bytes.
pub const MAX_NODE_ID_LEN: usize = u8::MAX as usize;

/// Number of bytes needed to hold `digits` packed digits.
pub fn packed_len(digits: usize) -> usize {
    (digits + 1) / 2
}

/// Pack a string of decimal digits into BCD nibbles.
pub fn pack_digits(digits: &str) -> Result<Vec<u8>, IdentifierError> {
    let mut nibbles = Vec::with_capacity(digits.len() + 1);
    for c in digits.chars() {
        let d = c.to_digit(10).ok_or(IdentifierError::InvalidDigitChar(c))?;
        nibbles.push(d as u8);
    }
    if nibbles.len() % 2 == 1 {
        nibbles.push(FILLER_NIBBLE);
    }
    Ok(nibbles
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect())
}

/// Unpack `digit_count` BCD digits from exactly `packed_len(digit_count)` bytes.
pub fn unpack_digits(bytes: &[u8], digit_count: usize) -> Result<String, IdentifierError> {
    let expected = packed_len(digit_count);
    if bytes.len() != expected {
        return Err(IdentifierError::LengthMismatch {
            digits: digit_count,
            expected,
            actual: bytes.len(),
        });
    }

    let mut out = String::with_capacity(digit_count);
    for position in 0..expected * 2 {
        let byte = bytes[position / 2];
        let nibble = if position % 2 == 0 { byte >> 4 } else { byte & 0x0F };

        if position == digit_count {
            // Only reachable for odd counts: the padding slot.
            if nibble != FILLER_NIBBLE {
                return Err(IdentifierError::InvalidDigit { position, nibble });
            }
            continue;
        }
        if nibble > 9 {
            return Err(IdentifierError::InvalidDigit { position, nibble });
        }
        out.push(char::from(b'0' + nibble));
    }
    Ok(out)
}

/// Public Land Mobile Network identity.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlmnIdentity {
    mcc: String,
    mnc: String,
}

impl PlmnIdentity {
    /// MCC must be 3 digits, MNC 2 or 3 digits.
    pub fn new(mcc: &str, mnc: &str) -> Result<Self, IdentifierError> {
        check_digits(mcc)?;
        check_digits(mnc)?;
        if mcc.len() != 3 || !(2..=3).contains(&mnc.len()) {
            return Err(IdentifierError::UnsupportedDigitCount(mcc.len() + mnc.len()));
        }
        Ok(Self {
            mcc: mcc.to_string(),
            mnc: mnc.to_string(),
        })
    }

    pub fn mcc(&self) -> &str {
        &self.mcc
    }

    pub fn mnc(&self) -> &str {
        &self.mnc
    }

    fn digits(&self) -> String {
        format!("{}{}", self.mcc, self.mnc)
    }
}

impl fmt::Debug for PlmnIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plmn({}-{})", self.mcc, self.mnc)
    }
}

fn check_digits(s: &str) -> Result<(), IdentifierError> {
    match s.chars().find(|c| !c.is_ascii_digit()) {
        Some(c) => Err(IdentifierError::InvalidDigitChar(c)),
        None => Ok(()),
    }
}

/// A RAN node identity: PLMN plus local node id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    plmn: PlmnIdentity,
    node_id: String,
}

impl Identifier {
    pub fn new(plmn: PlmnIdentity, node_id: impl Into<String>) -> Result<Self, IdentifierError> {
        let node_id = node_id.into();
        if node_id.is_empty() || node_id.len() > MAX_NODE_ID_LEN {
            return Err(IdentifierError::InvalidNodeId(node_id));
        }
        Ok(Self { plmn, node_id })
    }

    pub fn plmn(&self) -> &PlmnIdentity {
        &self.plmn
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Append the packed form to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), IdentifierError> {
        let digits = self.plmn.digits();
        buf.push(digits.len() as u8);
        buf.extend_from_slice(&pack_digits(&digits)?);
        buf.push(self.node_id.len() as u8);
        buf.extend_from_slice(self.node_id.as_bytes());
        Ok(())
    }

    /// Decode an identifier from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), IdentifierError> {
        let (&digit_count, rest) = bytes.split_first().ok_or(IdentifierError::LengthMismatch {
            digits: 0,
            expected: 1,
            actual: 0,
        })?;
        let digit_count = digit_count as usize;
        if !(5..=6).contains(&digit_count) {
            return Err(IdentifierError::UnsupportedDigitCount(digit_count));
        }

        let plmn_len = packed_len(digit_count);
        if rest.len() < plmn_len {
            return Err(IdentifierError::LengthMismatch {
                digits: digit_count,
                expected: plmn_len,
                actual: rest.len(),
            });
        }
        let digits = unpack_digits(&rest[..plmn_len], digit_count)?;
        let plmn = PlmnIdentity::new(&digits[..3], &digits[3..])?;

        let rest = &rest[plmn_len..];
        let (&node_len, rest) = rest
            .split_first()
            .ok_or_else(|| IdentifierError::InvalidNodeId("missing node id length".into()))?;
        let node_len = node_len as usize;
        if rest.len() < node_len {
            return Err(IdentifierError::InvalidNodeId(format!(
                "node id needs {} bytes, have {}",
                node_len,
                rest.len()
            )));
        }
        let node_id = std::str::from_utf8(&rest[..node_len])
            .map_err(|e| IdentifierError::InvalidNodeId(e.to_string()))?;

        let identifier = Identifier::new(plmn, node_id)?;
        Ok((identifier, 1 + plmn_len + 1 + node_len))
    }
}

/// Encode an identifier to its packed form.
pub fn encode(identifier: &Identifier) -> Result<Vec<u8>, IdentifierError> {
    let mut buf = Vec::with_capacity(8 + identifier.node_id.len());
    identifier.encode_into(&mut buf)?;
    Ok(buf)
}

/// Decode a packed identifier; the whole buffer must be consumed.
pub fn decode(bytes: &[u8]) -> Result<Identifier, IdentifierError> {
    let (identifier, used) = Identifier::decode_prefix(bytes)?;
    if used != bytes.len() {
        return Err(IdentifierError::TrailingBytes(bytes.len() - used));
    }
    Ok(identifier)
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}/{}", self.plmn.mcc, self.plmn.mnc, self.node_id)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    /// Parses `MCC-MNC/node`, e.g. `310-410/cell-7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (plmn, node) = s
            .split_once('/')
            .ok_or_else(|| IdentifierError::Parse(format!("missing '/' in {:?}", s)))?;
        let (mcc, mnc) = plmn
            .split_once('-')
            .ok_or_else(|| IdentifierError::Parse(format!("missing '-' in {:?}", plmn)))?;
        Identifier::new(PlmnIdentity::new(mcc, mnc)?, node)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_even_digits() {
        assert_eq!(pack_digits("310410").unwrap(), vec![0x31, 0x04, 0x10]);
    }

    #[test]
    fn test_pack_odd_digits_uses_filler() {
        assert_eq!(pack_digits("31041").unwrap(), vec![0x31, 0x04, 0x1F]);
        assert_eq!(unpack_digits(&[0x31, 0x04, 0x1F], 5).unwrap(), "31041");
    }

    #[test]
    fn test_unpack_rejects_bad_nibble() {
        let err = unpack_digits(&[0x3A, 0x04, 0x10], 6).unwrap_err();
        assert_eq!(
            err,
            IdentifierError::InvalidDigit {
                position: 1,
                nibble: 0x0A
            }
        );
    }

    #[test]
    fn test_unpack_rejects_filler_in_digit_position() {
        // Even count must not carry a filler.
        assert!(unpack_digits(&[0x31, 0x04, 0x1F], 6).is_err());
        // Odd count must carry exactly the filler.
        assert!(unpack_digits(&[0x31, 0x04, 0x10], 5).is_err());
    }

    #[test]
    fn test_unpack_rejects_length_mismatch() {
        let err = unpack_digits(&[0x31, 0x04], 5).unwrap_err();
        assert!(matches!(err, IdentifierError::LengthMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn test_identifier_roundtrip() {
        let id: Identifier = "310-410/cell-7".parse().unwrap();
        let bytes = encode(&id).unwrap();
        assert_eq!(&bytes[..4], &[6, 0x31, 0x04, 0x10]);
        assert_eq!(decode(&bytes).unwrap(), id);

        let short_mnc: Identifier = "244-91/gnb-001".parse().unwrap();
        assert_eq!(decode(&encode(&short_mnc).unwrap()).unwrap(), short_mnc);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let id: Identifier = "310-410/cell-7".parse().unwrap();
        let mut bytes = encode(&id).unwrap();
        bytes.push(0);
        assert_eq!(decode(&bytes).unwrap_err(), IdentifierError::TrailingBytes(1));
    }

    #[test]
    fn test_parse_rejects_bad_text() {
        assert!("310410/cell".parse::<Identifier>().is_err());
        assert!("31a-410/cell".parse::<Identifier>().is_err());
        assert!("310-410/".parse::<Identifier>().is_err());
        assert!("3100-410/x".parse::<Identifier>().is_err());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id: Identifier = "310-410/cell-7".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"310-410/cell-7\"");
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
