//! Provider and secret backends for keystack.
//!
//! Provides:
//! - `LocalProvider`, a file-backed resource provider
//! - `FileSecretResolver`, secrets from a JSON file
//! - `EnvSecretResolver`, secrets from environment variables

pub mod local;
pub mod secrets;

pub use local::{LocalProvider, StoredResource};
pub use secrets::{EnvSecretResolver, FileSecretResolver};
