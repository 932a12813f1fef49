//! Shared utilities for mcpd.
//!
//! This crate provides common utilities used across the mcpd workspace:
//! - ULID-based identifier generation
//! - Logging setup with tracing

pub mod id;
pub mod log;

pub use id::Identifier;
pub use log::{LogConfig, LogLevel};
