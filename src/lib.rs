#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod monitor;
pub mod nodes;
pub mod registry;
pub mod sender;
pub mod transport;

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
