//! Shared wire definitions for the rendezvous signaling relay.

pub mod signal;
