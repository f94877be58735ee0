//! Cormorant Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy, and protocol value
//! types shared across all Cormorant components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
