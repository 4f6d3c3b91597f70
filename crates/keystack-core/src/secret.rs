//! Secret references and the secret resolution capability.
//!
//! A [`SecretReference`] names a secret; it never carries the value. Values
//! come back from a [`SecretResolver`] wrapped in [`SecretString`], which
//! redacts itself in `Debug`, `Display` and `Serialize` and is zeroed on
//! drop. Call sites must use `.expose()` to read the plaintext.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroize;

use crate::Result;

/// The redaction placeholder used in all output.
pub const REDACTED: &str = "[REDACTED]";

/// How a secret reference is materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Fetch the value now and hand it to the provider call.
    #[default]
    Eager,
    /// Hand the provider a dynamic-reference token; the downstream API
    /// resolves it at its own materialization time.
    Deferred,
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionMode::Eager => write!(f, "eager"),
            ResolutionMode::Deferred => write!(f, "deferred"),
        }
    }
}

/// A named secret: a store entry plus an optional key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretReference {
    pub store: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default)]
    pub mode: ResolutionMode,
}

impl SecretReference {
    pub fn new(store: impl Into<String>, key_path: Option<String>, mode: ResolutionMode) -> Self {
        Self {
            store: store.into(),
            key_path,
            mode,
        }
    }

    /// Provider-native placeholder the downstream API resolves itself.
    pub fn dynamic_reference(&self) -> String {
        format!(
            "{{{{resolve:secretsmanager:{}:SecretString:{}}}}}",
            self.store,
            self.key_path.as_deref().unwrap_or("")
        )
    }
}

impl fmt::Display for SecretReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key_path {
            Some(key) => write!(f, "{}#{} ({})", self.store, key, self.mode),
            None => write!(f, "{} ({})", self.store, self.mode),
        }
    }
}

/// A plaintext secret that never prints itself.
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Explicitly access the plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({REDACTED:?})")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecretString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// A stored secret (can be a single string or key-value pairs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    /// A single secret string.
    String(String),
    /// A map of key-value pairs.
    Map(HashMap<String, String>),
}

impl SecretValue {
    /// Get a specific key, or the whole value when no key is given.
    ///
    /// A string secret holding a JSON object is searched by key as well.
    pub fn lookup(&self, key_path: Option<&str>) -> Option<String> {
        match (self, key_path) {
            (SecretValue::String(s), None) => Some(s.clone()),
            (SecretValue::String(s), Some(key)) => serde_json::from_str::<HashMap<String, String>>(s)
                .ok()
                .and_then(|m| m.get(key).cloned()),
            (SecretValue::Map(m), Some(key)) => m.get(key).cloned(),
            (SecretValue::Map(m), None) if m.len() == 1 => m.values().next().cloned(),
            (SecretValue::Map(_), None) => None,
        }
    }
}

/// Trait for secret storage backends.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Name of this resolver.
    fn name(&self) -> &'static str;

    /// Fetch the plaintext for a reference.
    ///
    /// Fails with `Error::SecretNotFound` when the store or key is absent.
    async fn resolve(&self, reference: &SecretReference) -> Result<SecretString>;

    /// Token passed to the provider for deferred references.
    fn dynamic_reference(&self, reference: &SecretReference) -> String {
        reference.dynamic_reference()
    }
}
