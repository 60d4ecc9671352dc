//! Shared infrastructure for the sonotag workspace
//!
//! Error type, TOML configuration, and database pool initialization
//! used by the engine crate.

pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};
