//! Rendezvous relay library.
//!
//! Exposes the room registry, message router and WebSocket server for use in
//! tests and embedding. Clients join a named room and exchange opaque
//! negotiation messages with the other members of that room; the relay only
//! reads the `type` and `roomId` fields it needs for routing.

pub mod config;
pub mod relay;
pub mod rooms;
pub mod router;
