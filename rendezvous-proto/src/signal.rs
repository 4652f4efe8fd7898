//! Signaling envelope for the rendezvous relay.
//!
//! Clients exchange JSON objects over a WebSocket. The relay only reads two
//! routing fields from each object (`type` and `roomId`) and treats the
//! rest of the object as opaque negotiation payload that belongs to the
//! peers. [`Inbound::parse`] classifies a raw message without building a
//! fixed schema for it, so the caller can forward the original text verbatim.

use std::fmt;

use serde_json::{Map, Value};

/// Name of the discriminator field.
pub const TYPE_FIELD: &str = "type";

/// Name of the room routing field.
pub const ROOM_ID_FIELD: &str = "roomId";

/// Message types the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Membership request; consumed by the relay, never forwarded.
    Join,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Connectivity candidate.
    IceCandidate,
}

impl SignalKind {
    /// Maps a wire `type` value to a known kind, or `None` for anything the
    /// relay does not route.
    #[must_use]
    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "join" => Some(Self::Join),
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }

    /// The wire spelling of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    /// Whether messages of this kind are fanned out to the rest of the room.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        !matches!(self, Self::Join)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an inbound message cannot be routed.
///
/// None of these are ever reported to the sending peer; the relay drops the
/// message and keeps the connection open.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The message is not a JSON object.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `type` field is absent or not a string.
    #[error("message has no string `type` field")]
    MissingType,

    /// A routed message has no usable `roomId` (absent, not a string, or
    /// empty).
    #[error("`{kind}` message has no usable `roomId`")]
    MissingRoomId {
        /// Kind of the message that was missing its room.
        kind: SignalKind,
    },
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Request to join `room_id`.
    Join {
        /// Target room.
        room_id: String,
    },

    /// Negotiation message to fan out to the other members of `room_id`.
    Forward {
        /// Offer, answer or candidate.
        kind: SignalKind,
        /// Room whose members receive the message.
        room_id: String,
    },

    /// A well-formed message with a `type` the relay does not route.
    Ignored {
        /// The unrecognized `type` value.
        kind: String,
    },
}

impl Inbound {
    /// Classifies a raw JSON message.
    ///
    /// Only `type` and `roomId` are inspected. Unknown types classify as
    /// [`Inbound::Ignored`] whether or not they carry a room, so newer
    /// clients can add message types without the relay rejecting them.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if `raw` is not a JSON object,
    /// [`EnvelopeError::MissingType`] if there is no string `type`, and
    /// [`EnvelopeError::MissingRoomId`] if a routed kind has no non-empty
    /// string `roomId`.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let object: Map<String, Value> = serde_json::from_str(raw)?;

        let Some(Value::String(type_value)) = object.get(TYPE_FIELD) else {
            return Err(EnvelopeError::MissingType);
        };

        let Some(kind) = SignalKind::from_type(type_value) else {
            return Ok(Self::Ignored {
                kind: type_value.clone(),
            });
        };

        let room_id = match object.get(ROOM_ID_FIELD) {
            Some(Value::String(room_id)) if !room_id.is_empty() => room_id.clone(),
            _ => return Err(EnvelopeError::MissingRoomId { kind }),
        };

        if kind.is_forwarded() {
            Ok(Self::Forward { kind, room_id })
        } else {
            Ok(Self::Join { room_id })
        }
    }

    /// The room this message addresses, if it is routed.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Join { room_id } | Self::Forward { room_id, .. } => Some(room_id),
            Self::Ignored { .. } => None,
        }
    }
}
