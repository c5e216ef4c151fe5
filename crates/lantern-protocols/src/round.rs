//! Round protocol wire format and validation rules.
//!
//! # Wire Format
//!
//! ```text
//! message := uuid[16] || code[1] || bulk[payload_len]
//! ```
//!
//! Requests carry the round number as an ASCII digit. Responses carry a
//! [`RoundOutcome`] code. The bulk payload is a fixed, content-checked
//! pattern both sides know in advance; a mismatch means the link corrupted
//! data.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Width of the participant uuid field.
pub const UUID_LEN: usize = 16;

/// Default bulk payload length.
pub const DEFAULT_PAYLOAD_LEN: usize = 1024;

/// Highest round number that fits the one-byte code.
pub const MAX_ROUND: u32 = 9;

/// Server verdict on an incoming round message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundOutcome {
    /// The sender is on a different round.
    WrongGeneration,
    /// The sender is not a participant.
    WrongTestSet,
    /// Everything checked out.
    Success,
    /// The message carried the server's own uuid.
    WrongSelfReference,
    /// The bulk payload was corrupted.
    WrongSyntax,
}

impl RoundOutcome {
    /// ASCII wire code.
    pub const fn code(self) -> u8 {
        match self {
            Self::WrongGeneration => b'0',
            Self::WrongTestSet => b'1',
            Self::Success => b'2',
            Self::WrongSelfReference => b'3',
            Self::WrongSyntax => b'4',
        }
    }

    /// Decode a wire code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            b'0' => Some(Self::WrongGeneration),
            b'1' => Some(Self::WrongTestSet),
            b'2' => Some(Self::Success),
            b'3' => Some(Self::WrongSelfReference),
            b'4' => Some(Self::WrongSyntax),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WrongGeneration => "WRONG_GENERATION",
            Self::WrongTestSet => "WRONG_TEST_SET",
            Self::Success => "SUCCESS",
            Self::WrongSelfReference => "WRONG_SELF_REFERENCE",
            Self::WrongSyntax => "WRONG_SYNTAX",
        };
        f.write_str(name)
    }
}

/// Encode a round number as its one-byte wire code.
pub fn round_code(round: u32) -> Result<u8> {
    if round > MAX_ROUND {
        return Err(Error::InvalidRound(round));
    }
    Ok(b'0' + round as u8)
}

/// The canonical bulk payload of the given length.
pub fn canonical_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A decoded round message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundMessage {
    pub uuid: Uuid,
    pub code: u8,
    pub payload: Vec<u8>,
}

impl RoundMessage {
    /// Total encoded length for a given payload length.
    pub const fn encoded_len(payload_len: usize) -> usize {
        UUID_LEN + 1 + payload_len
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(self.payload.len()));
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.push(self.code);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode wire bytes. The length must match exactly.
    pub fn decode(bytes: &[u8], payload_len: usize) -> Result<Self> {
        let expected = Self::encoded_len(payload_len);
        if bytes.len() != expected {
            return Err(Error::InvalidMessage(format!(
                "expected {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }
        let uuid = Uuid::from_slice(&bytes[..UUID_LEN])
            .map_err(|e| Error::InvalidMessage(e.to_string()))?;
        Ok(Self {
            uuid,
            code: bytes[UUID_LEN],
            payload: bytes[UUID_LEN + 1..].to_vec(),
        })
    }
}

/// Everything a peer needs to build and judge round messages.
#[derive(Debug, Clone)]
pub struct RoundContext {
    local: Uuid,
    participants: BTreeSet<Uuid>,
    payload: Vec<u8>,
}

impl RoundContext {
    /// Create a context. The local uuid is always a participant.
    pub fn new(local: Uuid, participants: impl IntoIterator<Item = Uuid>, payload_len: usize) -> Self {
        let mut participants: BTreeSet<Uuid> = participants.into_iter().collect();
        participants.insert(local);
        Self {
            local,
            participants,
            payload: canonical_payload(payload_len),
        }
    }

    /// Our own uuid.
    pub fn local(&self) -> Uuid {
        self.local
    }

    /// The fixed participant set, including ourselves.
    pub fn participants(&self) -> &BTreeSet<Uuid> {
        &self.participants
    }

    /// Everyone but ourselves.
    pub fn others(&self) -> BTreeSet<Uuid> {
        self.participants
            .iter()
            .copied()
            .filter(|p| *p != self.local)
            .collect()
    }

    /// The canonical bulk payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded length of every message.
    pub fn message_len(&self) -> usize {
        RoundMessage::encoded_len(self.payload.len())
    }

    /// Request sent by the client role.
    pub fn request(&self, round_code: u8) -> RoundMessage {
        RoundMessage {
            uuid: self.local,
            code: round_code,
            payload: self.payload.clone(),
        }
    }

    /// Response sent by the server role.
    pub fn response(&self, outcome: RoundOutcome) -> RoundMessage {
        RoundMessage {
            uuid: self.local,
            code: outcome.code(),
            payload: self.payload.clone(),
        }
    }

    /// Server-side verdict on a request for the given round.
    ///
    /// Checks run in a fixed order: participant membership, payload
    /// integrity, self reference, round number.
    pub fn validate_request(&self, request: &RoundMessage, round_code: u8) -> RoundOutcome {
        if !self.participants.contains(&request.uuid) {
            RoundOutcome::WrongTestSet
        } else if request.payload != self.payload {
            RoundOutcome::WrongSyntax
        } else if request.uuid == self.local {
            RoundOutcome::WrongSelfReference
        } else if request.code != round_code {
            RoundOutcome::WrongGeneration
        } else {
            RoundOutcome::Success
        }
    }

    /// Client-side interpretation of a response.
    ///
    /// Returns the responder on success, [`Error::NonFatal`] for mismatches
    /// worth retrying, and [`Error::Fatal`] for mismatches that invalidate
    /// the round.
    pub fn interpret_response(&self, response: &RoundMessage) -> Result<Uuid> {
        if !self.participants.contains(&response.uuid) {
            return Err(Error::NonFatal(format!(
                "response from unknown participant {}",
                response.uuid
            )));
        }
        if response.payload != self.payload {
            return Err(Error::Fatal(format!(
                "corrupted payload from {}",
                response.uuid
            )));
        }
        match RoundOutcome::from_code(response.code) {
            Some(RoundOutcome::Success) => Ok(response.uuid),
            Some(outcome @ (RoundOutcome::WrongSelfReference | RoundOutcome::WrongGeneration)) => {
                Err(Error::NonFatal(format!("{} answered {}", response.uuid, outcome)))
            }
            Some(outcome @ (RoundOutcome::WrongTestSet | RoundOutcome::WrongSyntax)) => {
                Err(Error::Fatal(format!("{} answered {}", response.uuid, outcome)))
            }
            None => Err(Error::Fatal(format!(
                "{} answered unknown code {:#04x}",
                response.uuid, response.code
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD_LEN: usize = 64;

    struct Fixture {
        server: RoundContext,
        a: Uuid,
        b: Uuid,
    }

    fn fixture() -> Fixture {
        let server = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        Fixture {
            server: RoundContext::new(server, [a, b], PAYLOAD_LEN),
            a,
            b,
        }
    }

    fn request(uuid: Uuid, code: u8) -> RoundMessage {
        RoundMessage {
            uuid,
            code,
            payload: canonical_payload(PAYLOAD_LEN),
        }
    }

    #[test]
    fn outcome_codes_roundtrip() {
        for outcome in [
            RoundOutcome::WrongGeneration,
            RoundOutcome::WrongTestSet,
            RoundOutcome::Success,
            RoundOutcome::WrongSelfReference,
            RoundOutcome::WrongSyntax,
        ] {
            assert_eq!(RoundOutcome::from_code(outcome.code()), Some(outcome));
        }
        assert_eq!(RoundOutcome::from_code(b'9'), None);
    }

    #[test]
    fn round_codes_are_ascii_digits() {
        assert_eq!(round_code(0).unwrap(), b'0');
        assert_eq!(round_code(1).unwrap(), b'1');
        assert_eq!(round_code(9).unwrap(), b'9');
        assert!(matches!(round_code(10), Err(Error::InvalidRound(10))));
    }

    #[test]
    fn message_decode_requires_exact_length() {
        let msg = request(Uuid::new_v4(), b'1');
        let bytes = msg.encode();
        assert_eq!(bytes.len(), RoundMessage::encoded_len(PAYLOAD_LEN));
        assert_eq!(RoundMessage::decode(&bytes, PAYLOAD_LEN).unwrap(), msg);
        assert!(RoundMessage::decode(&bytes[1..], PAYLOAD_LEN).is_err());
    }

    #[test]
    fn valid_request_succeeds() {
        let f = fixture();
        assert_eq!(
            f.server.validate_request(&request(f.a, b'1'), b'1'),
            RoundOutcome::Success
        );
    }

    #[test]
    fn corrupted_payload_is_wrong_syntax() {
        let f = fixture();
        let mut msg = request(f.a, b'1');
        msg.payload[10] ^= 0xFF;
        assert_eq!(f.server.validate_request(&msg, b'1'), RoundOutcome::WrongSyntax);
    }

    #[test]
    fn own_uuid_is_wrong_self_reference() {
        let f = fixture();
        let msg = request(f.server.local(), b'1');
        assert_eq!(
            f.server.validate_request(&msg, b'1'),
            RoundOutcome::WrongSelfReference
        );
    }

    #[test]
    fn other_round_is_wrong_generation() {
        let f = fixture();
        assert_eq!(
            f.server.validate_request(&request(f.b, b'0'), b'1'),
            RoundOutcome::WrongGeneration
        );
    }

    #[test]
    fn stranger_is_wrong_test_set() {
        let f = fixture();
        let mut msg = request(Uuid::new_v4(), b'1');
        // Membership is checked before payload integrity.
        msg.payload[0] ^= 0xFF;
        assert_eq!(f.server.validate_request(&msg, b'1'), RoundOutcome::WrongTestSet);
    }

    #[test]
    fn success_response_names_responder() {
        let f = fixture();
        let client = RoundContext::new(f.a, [f.server.local(), f.b], PAYLOAD_LEN);
        let response = f.server.response(RoundOutcome::Success);
        assert_eq!(client.interpret_response(&response).unwrap(), f.server.local());
    }

    #[test]
    fn retryable_responses_are_non_fatal() {
        let f = fixture();
        let client = RoundContext::new(f.a, [f.server.local(), f.b], PAYLOAD_LEN);
        for outcome in [RoundOutcome::WrongGeneration, RoundOutcome::WrongSelfReference] {
            let err = client.interpret_response(&f.server.response(outcome)).unwrap_err();
            assert!(matches!(err, Error::NonFatal(_)), "{:?}", outcome);
        }

        let stranger = RoundContext::new(Uuid::new_v4(), [], PAYLOAD_LEN);
        let err = client
            .interpret_response(&stranger.response(RoundOutcome::Success))
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn systemic_responses_are_fatal() {
        let f = fixture();
        let client = RoundContext::new(f.a, [f.server.local(), f.b], PAYLOAD_LEN);
        for outcome in [RoundOutcome::WrongTestSet, RoundOutcome::WrongSyntax] {
            let err = client.interpret_response(&f.server.response(outcome)).unwrap_err();
            assert!(err.is_fatal(), "{:?}", outcome);
        }

        let mut corrupted = f.server.response(RoundOutcome::Success);
        corrupted.payload[3] ^= 0x01;
        assert!(client.interpret_response(&corrupted).unwrap_err().is_fatal());

        let mut unknown = f.server.response(RoundOutcome::Success);
        unknown.code = b'x';
        assert!(client.interpret_response(&unknown).unwrap_err().is_fatal());
    }

    #[test]
    fn others_excludes_local() {
        let f = fixture();
        let others = f.server.others();
        assert_eq!(others.len(), 2);
        assert!(!others.contains(&f.server.local()));
        assert_eq!(f.server.participants().len(), 3);
    }
}
