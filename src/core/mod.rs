//! Core functionality module
//!
//! Configuration and error handling shared by the library and the binary.
//!
//! # Submodules
//!
//! - `config` - Configuration loading, saving, and management
//! - `error` - Error types and result aliases

pub mod config;
pub mod error;
