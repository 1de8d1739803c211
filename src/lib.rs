//! tinyhook - a self-hosted deploy daemon
//!
//! This library provides a single-host deployment daemon that:
//! - Clones, builds and runs a fixed set of apps from git repositories
//! - Redeploys an app when GitHub reports a push to its tracked branch
//! - Routes HTTP traffic to the running app selected by the Host header
//! - Waits for each launch to answer `/_/heartbeat` and keeps probing it
//! - Writes every subprocess invocation's output to its own log file

pub mod config;
pub mod deploy;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod hook;
pub mod logs;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod runtime;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
