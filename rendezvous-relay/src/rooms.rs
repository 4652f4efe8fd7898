//! Connection registry for the relay server.
//!
//! Maps room ids to the set of connections currently in each room. Rooms are
//! created by the first join and removed by the leave that empties them, so
//! every room the registry reports has at least one member.
//!
//! All membership state sits behind one [`parking_lot::Mutex`]. Joins, leaves
//! and the membership snapshot taken by [`Registry::broadcast`] therefore
//! never interleave. Deliveries happen after the lock is released and never
//! block: each connection has a bounded outbound queue and a full or closed
//! queue evicts that recipient from the room.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Opaque room identifier.
pub type RoomId = String;

/// Unique identifier for one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh, time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A negotiation message forwarded from another room member.
    Signal(Arc<str>),
    /// Ask the writer to close the socket.
    Close,
}

/// Send side of one client connection.
///
/// Cheap to clone; every clone shares the same id and outbound queue.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
}

impl Connection {
    /// Wraps an existing outbound queue under a fresh id.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: ConnectionId::new(),
            outbound,
        }
    }

    /// Creates a connection together with the receiving end of its outbound
    /// queue. A capacity of zero is raised to one.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// This connection's id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns the rejected frame if the queue is full or the writer is gone.
    pub fn try_send(&self, frame: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.outbound.try_send(frame)
    }
}

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Rooms must have a non-empty id.
    #[error("room id must not be empty")]
    EmptyRoomId,
}

/// Result of a successful [`Registry::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection is now a member of the target room.
    Joined {
        /// Room the connection was moved out of, if any.
        previous: Option<RoomId>,
    },
    /// The connection was already in the target room; nothing changed.
    AlreadyMember,
}

/// Result of a [`Registry::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose queue accepted the message.
    pub delivered: usize,
    /// Recipients removed from the room because delivery failed.
    pub evicted: Vec<ConnectionId>,
}

/// Registry-side record of a joined connection.
#[derive(Debug)]
struct Member {
    room: RoomId,
    outbound: mpsc::Sender<Outbound>,
}

#[derive(Debug, Default)]
struct Membership {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    members: HashMap<ConnectionId, Member>,
}

impl Membership {
    fn attach(&mut self, conn: &Connection, room_id: &str) {
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn.id);
        self.members.insert(
            conn.id,
            Member {
                room: room_id.to_string(),
                outbound: conn.outbound.clone(),
            },
        );
    }

    /// Removes `id` from its room, dropping the room once it is empty.
    fn detach(&mut self, id: ConnectionId) -> Option<RoomId> {
        let member = self.members.remove(&id)?;
        if let Some(set) = self.rooms.get_mut(&member.room) {
            set.remove(&id);
            if set.is_empty() {
                self.rooms.remove(&member.room);
            }
        }
        Some(member.room)
    }
}

/// In-memory room membership registry.
///
/// Create one per server and share it behind an [`Arc`].
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Membership>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts `conn` into `room_id`, leaving its current room first.
    ///
    /// Joining the room the connection is already in is a no-op. Leaving the
    /// previous room and entering the new one happen under one lock
    /// acquisition, so no broadcast can see the connection in both rooms or
    /// in neither.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EmptyRoomId`] if `room_id` is empty.
    pub fn join(&self, conn: &Connection, room_id: &str) -> Result<JoinOutcome, RegistryError> {
        if room_id.is_empty() {
            return Err(RegistryError::EmptyRoomId);
        }

        let mut membership = self.inner.lock();
        let current = membership
            .members
            .get(&conn.id)
            .map(|member| member.room == room_id);

        let previous = match current {
            Some(true) => return Ok(JoinOutcome::AlreadyMember),
            Some(false) => membership.detach(conn.id),
            None => None,
        };
        membership.attach(conn, room_id);
        drop(membership);

        Ok(JoinOutcome::Joined { previous })
    }

    /// Removes the connection from its room, returning the room it left.
    ///
    /// Returns `None` if the connection was not in a room; calling it again
    /// after a successful leave is harmless.
    pub fn leave(&self, id: ConnectionId) -> Option<RoomId> {
        self.inner.lock().detach(id)
    }

    /// Delivers `message` to every member of `room_id` except `sender`.
    ///
    /// The recipient list is snapshotted under the lock; delivery runs after
    /// it is released. A recipient whose queue is full or closed misses this
    /// message and is evicted from the room if it is still a member of it.
    /// An unknown room is a no-op. The sender does not need to be a member.
    pub fn broadcast(
        &self,
        room_id: &str,
        message: &Arc<str>,
        sender: ConnectionId,
    ) -> BroadcastReport {
        let recipients: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = {
            let membership = self.inner.lock();
            let Some(room) = membership.rooms.get(room_id) else {
                return BroadcastReport::default();
            };
            room.iter()
                .filter(|id| **id != sender)
                .filter_map(|id| {
                    membership
                        .members
                        .get(id)
                        .map(|member| (*id, member.outbound.clone()))
                })
                .collect()
        };

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, outbound) in recipients {
            match outbound.try_send(Outbound::Signal(Arc::clone(message))) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(conn_id = %id, room_id = %room_id, "outbound queue full, dropping delivery");
                    failed.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(conn_id = %id, room_id = %room_id, "outbound queue closed, dropping delivery");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut membership = self.inner.lock();
            for id in failed {
                let still_here = membership
                    .members
                    .get(&id)
                    .is_some_and(|member| member.room == room_id);
                if still_here {
                    membership.detach(id);
                    report.evicted.push(id);
                }
            }
            drop(membership);

            for id in &report.evicted {
                tracing::warn!(conn_id = %id, room_id = %room_id, "evicted unreachable member");
            }
        }

        report
    }

    /// Returns the room the connection is currently in.
    pub fn room_of(&self, id: ConnectionId) -> Option<RoomId> {
        self.inner.lock().members.get(&id).map(|m| m.room.clone())
    }

    /// Returns the current members of a room (empty for an unknown room).
    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a room with this id currently exists.
    pub fn contains_room(&self, room_id: &str) -> bool {
        self.inner.lock().rooms.contains_key(room_id)
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    /// Number of connections that are in some room.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().members.len()
    }
}
