//! Data Relay Module
//!
//! Dials the remote target for each accepted connection and relays bytes
//! in both directions until either side ends the session.

pub mod engine;
pub mod session;

pub use engine::RelayEngine;
pub use session::{ConnectionStats, RelaySession, SessionEnd};
