//! Phoenix server - HTTP/2 tunneling proxy with Ed25519-pinned TLS.

pub mod config;
pub mod connection;
pub mod identity;
pub mod metrics;
pub mod proxy;
pub mod router;
pub mod transport;
pub mod util;
pub mod wire;

pub use config::Config;

/// Server version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
