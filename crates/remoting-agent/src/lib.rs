//! # Remoting Agent
//!
//! Serves a remoting channel on behalf of a controller, over stdio or a
//! single TCP connection.

#![warn(missing_docs)]

/// Channel launch and the ping watchdog
pub mod launcher;

/// Standard work units
pub mod units;

pub use launcher::{run, Endpoint, Exit, LauncherConfig, PingConfig};
pub use units::standard_builder;
