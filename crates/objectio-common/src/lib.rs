//! ObjectIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions, configuration
//! tree and checksum helpers used across all ObjectIO components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
