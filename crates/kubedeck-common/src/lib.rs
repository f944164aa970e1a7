//! Common types for kubedeck: errors, settings and logging

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{LogFormat, Settings};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the keep-alive event written by live feeds on swallowed refresh failures
pub const KEEP_ALIVE_EVENT: &str = "keep-alive";
