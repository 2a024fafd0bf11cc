//! Murmur Core Library
//!
//! Shared functionality for Murmur components:
//! - Configuration resolution and hierarchy
//! - Tracing/logging initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
