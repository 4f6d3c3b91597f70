//! Secret resolvers backed by a local file or the process environment.

use async_trait::async_trait;
use keystack_core::{Error, Result, SecretReference, SecretResolver, SecretString, SecretValue};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Resolves secrets from a JSON file mapping store names to values.
///
/// ```json
/// {
///   "app/google": { "clientSecret": "..." },
///   "app/token": "plain-string"
/// }
/// ```
pub struct FileSecretResolver {
    stores: HashMap<String, SecretValue>,
}

impl FileSecretResolver {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Internal(format!("{}: {e}", path.display())))?;
        let stores: HashMap<String, SecretValue> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Validation(format!("invalid secrets file {}: {e}", path.display())))?;

        debug!(path = %path.display(), stores = stores.len(), "Loaded secrets file");
        Ok(Self { stores })
    }

    pub fn from_stores(stores: HashMap<String, SecretValue>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl SecretResolver for FileSecretResolver {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn resolve(&self, reference: &SecretReference) -> Result<SecretString> {
        self.stores
            .get(&reference.store)
            .and_then(|value| value.lookup(reference.key_path.as_deref()))
            .map(SecretString::new)
            .ok_or_else(|| Error::SecretNotFound(reference.to_string()))
    }
}

const ENV_PREFIX: &str = "KEYSTACK_SECRET_";

/// Resolves secrets from `KEYSTACK_SECRET_*` environment variables.
///
/// Store `app/google` with key `clientSecret` is read from
/// `KEYSTACK_SECRET_APP_GOOGLE__CLIENTSECRET`, falling back to a JSON
/// object in `KEYSTACK_SECRET_APP_GOOGLE`.
pub struct EnvSecretResolver {
    vars: HashMap<String, String>,
}

impl EnvSecretResolver {
    /// Snapshot the matching variables of the current process.
    pub fn from_env() -> Self {
        Self::from_map(
            std::env::vars()
                .filter(|(key, _)| key.starts_with(ENV_PREFIX))
                .collect(),
        )
    }

    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    /// Variable name for a store, with an optional key suffix.
    pub fn variable_name(store: &str, key: Option<&str>) -> String {
        let mut name = format!("{ENV_PREFIX}{}", normalize(store));
        if let Some(key) = key {
            name.push_str("__");
            name.push_str(&normalize(key));
        }
        name
    }
}

fn normalize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn resolve(&self, reference: &SecretReference) -> Result<SecretString> {
        let key = reference.key_path.as_deref();

        if key.is_some() {
            if let Some(value) = self.vars.get(&Self::variable_name(&reference.store, key)) {
                return Ok(SecretString::new(value.as_str()));
            }
        }

        self.vars
            .get(&Self::variable_name(&reference.store, None))
            .and_then(|raw| SecretValue::String(raw.clone()).lookup(key))
            .map(SecretString::new)
            .ok_or_else(|| Error::SecretNotFound(reference.to_string()))
    }
}
