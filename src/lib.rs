//! PortRelay Library
//!
//! Protocol-agnostic local TCP port forwarder. Every connection accepted on
//! the local port is paired with a fresh connection to a fixed remote
//! target, and bytes are relayed both ways until either side closes.

pub mod config;
pub mod listener;
pub mod relay;
pub mod shutdown;

pub use config::{Config, ForwardSpec};
pub use listener::Listener;
pub use relay::RelayEngine;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the forwarder
pub type Result<T> = anyhow::Result<T>;
