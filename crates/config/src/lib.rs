//! Configuration module for loopcast
//!
//! Handles loading the streaming settings from TOML files, environment variable
//! overrides, and validation of the enumerated settings surface.

pub mod config;

pub use config::*;
