//! collector-agent - host metrics agent library.
//!
//! Scrapes a local node exporter and `nvidia-smi`, builds one JSON snapshot
//! per interval and POSTs it to a remote collector. The `collector-agent`
//! binary wraps this library with a CLI and daemon management.

pub mod collector;
pub mod config;
pub mod daemon;
pub mod exporter;
pub mod logging;
pub mod model;
pub mod parser;
pub mod sender;
pub mod shutdown;
pub mod transform;
pub mod util;

/// Crate version reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
