//! Per-connection message dispatch.
//!
//! The [`Router`] turns one inbound frame into at most one registry
//! operation: a `join` changes membership, an offer/answer/candidate is fanned
//! out to the rest of its room as the original text, and everything else is
//! dropped. Nothing is ever sent back to the sender.

use std::sync::Arc;

use rendezvous_proto::signal::{EnvelopeError, Inbound, SignalKind};

use crate::rooms::{Connection, ConnectionId, JoinOutcome, Registry, RoomId};

/// Default maximum size of an inbound message in bytes (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Why an inbound message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Larger than the configured maximum.
    TooLarge,
    /// Binary frame that is not UTF-8.
    NotUtf8,
    /// Not a JSON object.
    Malformed,
    /// No string `type` field.
    MissingType,
    /// Routed kind without a usable `roomId`.
    MissingRoomId,
    /// The registry refused the join.
    Rejected,
}

impl From<&EnvelopeError> for DropReason {
    fn from(err: &EnvelopeError) -> Self {
        match err {
            EnvelopeError::Malformed(_) => Self::Malformed,
            EnvelopeError::MissingType => Self::MissingType,
            EnvelopeError::MissingRoomId { .. } => Self::MissingRoomId,
        }
    }
}

/// What [`Router::dispatch`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The connection joined (or was already in) a room.
    Joined {
        /// Room joined.
        room_id: RoomId,
        /// Registry result.
        outcome: JoinOutcome,
    },
    /// The message was fanned out to the room.
    Forwarded {
        /// Kind of message forwarded.
        kind: SignalKind,
        /// Recipients that accepted it.
        delivered: usize,
    },
    /// Well-formed message with a type the relay does not route.
    Ignored,
    /// The message was discarded.
    Dropped(DropReason),
}

/// Routes inbound messages into a shared [`Registry`].
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    max_message_size: usize,
}

impl Router {
    /// Creates a router over `registry` with the default size limit.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_max_message_size(registry, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Creates a router with a custom inbound size limit.
    #[must_use]
    pub fn with_max_message_size(registry: Arc<Registry>, max_message_size: usize) -> Self {
        Self {
            registry,
            max_message_size,
        }
    }

    /// The registry this router mutates.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handles one text message from `conn`.
    pub fn dispatch(&self, conn: &Connection, raw: &str) -> Dispatch {
        let conn_id = conn.id();

        if raw.len() > self.max_message_size {
            return self.dispatch_oversized(conn, raw.len());
        }

        let inbound = match Inbound::parse(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "dropping unroutable message");
                return Dispatch::Dropped(DropReason::from(&e));
            }
        };

        match inbound {
            Inbound::Join { room_id } => match self.registry.join(conn, &room_id) {
                Ok(outcome) => {
                    if let JoinOutcome::Joined { previous } = &outcome {
                        tracing::info!(
                            conn_id = %conn_id,
                            room_id = %room_id,
                            previous = ?previous,
                            "joined room"
                        );
                    }
                    Dispatch::Joined { room_id, outcome }
                }
                Err(e) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "join rejected");
                    Dispatch::Dropped(DropReason::Rejected)
                }
            },
            Inbound::Forward { kind, room_id } => {
                let message: Arc<str> = Arc::from(raw);
                let report = self.registry.broadcast(&room_id, &message, conn_id);
                tracing::debug!(
                    conn_id = %conn_id,
                    room_id = %room_id,
                    kind = %kind,
                    delivered = report.delivered,
                    evicted = report.evicted.len(),
                    "forwarded message"
                );
                Dispatch::Forwarded {
                    kind,
                    delivered: report.delivered,
                }
            }
            Inbound::Ignored { kind } => {
                tracing::debug!(conn_id = %conn_id, kind = %kind, "ignoring unknown message type");
                Dispatch::Ignored
            }
        }
    }

    /// Handles one binary frame from `conn`; it must hold UTF-8 JSON.
    pub fn dispatch_binary(&self, conn: &Connection, data: &[u8]) -> Dispatch {
        if data.len() > self.max_message_size {
            return self.dispatch_oversized(conn, data.len());
        }
        match std::str::from_utf8(data) {
            Ok(text) => self.dispatch(conn, text),
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "dropping non-UTF-8 binary frame");
                Dispatch::Dropped(DropReason::NotUtf8)
            }
        }
    }

    /// Runs the termination path for a connection: leaves its room.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Option<RoomId> {
        let left = self.registry.leave(conn_id);
        if let Some(room_id) = &left {
            tracing::info!(conn_id = %conn_id, room_id = %room_id, "left room on disconnect");
        }
        left
    }

    fn dispatch_oversized(&self, conn: &Connection, size: usize) -> Dispatch {
        tracing::debug!(
            conn_id = %conn.id(),
            size = size,
            max = self.max_message_size,
            "dropping oversized message"
        );
        Dispatch::Dropped(DropReason::TooLarge)
    }
}
