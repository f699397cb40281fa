//! Listener Module
//!
//! Binds the local port and hands every accepted connection to the relay.

pub mod server;

pub use server::Listener;
