//! Shared utilities for the tunnel service and its clients.
//!
//! This crate provides configuration loading, logging setup, and the key
//! helpers used when presenting tunnel configurations.

pub mod config;
pub mod keys;
pub mod logging;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError, ConfigManager};
