// network/mod.rs - Message Transport

//! Transport layer consumed by the negotiation core.
//!
//! This module provides:
//! - `Transport` - fire-and-forget delivery to agents and broadcast groups
//! - `EmuNetwork` - in-memory mailboxes used by tests and simulations
//!
//! The actor runtime brings its own transport, see
//! [`crate::actor::ActorTransport`].

mod transport;

pub use transport::{EmuNetwork, Transport};
