//! Core utilities for the frame pacing crates.
//!
//! This crate provides foundational types and utilities used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Timer utilities
//! - Configuration management

pub mod config;
mod error;
mod logging;
mod timer;

pub use config::{FormatPreference, PresentModePreference, RendererConfig};
pub use error::{Error, Result};
pub use logging::{DEFAULT_LOG_FILTER, init_logging, init_logging_with};
pub use timer::Timer;
