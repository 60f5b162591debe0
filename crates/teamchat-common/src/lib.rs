//! Shared error types and context helpers used across all teamchat crates.

pub mod error;

pub use error::{Error, FromMessage, Result};
