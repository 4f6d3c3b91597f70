//! Resource provider trait and the values exchanged with it.
//!
//! Providers manage the actual cloud resources (pools, domains, buckets, ...).
//! They are idempotent: applying identical properties to an existing
//! resource is a no-op reported as [`ChangeKind::Unchanged`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::secret::{REDACTED, SecretString};
use crate::{NodeId, ResourceKind, Result};

/// A property value after references and secrets have been resolved.
///
/// Lives only for the duration of one provider call.
#[derive(Debug, Clone)]
pub enum ResolvedValue {
    Literal(serde_json::Value),
    Secret(SecretString),
    /// Dynamic-reference token resolved downstream.
    Deferred(String),
    List(Vec<ResolvedValue>),
    Map(BTreeMap<String, ResolvedValue>),
}

impl ResolvedValue {
    /// Plaintext JSON for the provider's API request body.
    pub fn expose(&self) -> serde_json::Value {
        match self {
            ResolvedValue::Literal(v) => v.clone(),
            ResolvedValue::Secret(s) => serde_json::Value::String(s.expose().to_string()),
            ResolvedValue::Deferred(token) => serde_json::Value::String(token.clone()),
            ResolvedValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ResolvedValue::expose).collect())
            }
            ResolvedValue::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.expose())).collect(),
            ),
        }
    }

    /// JSON safe to log or persist: eager secrets become `[REDACTED]`.
    pub fn redacted(&self) -> serde_json::Value {
        match self {
            ResolvedValue::Secret(_) => serde_json::Value::String(REDACTED.to_string()),
            ResolvedValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ResolvedValue::redacted).collect())
            }
            ResolvedValue::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.redacted())).collect(),
            ),
            other => other.expose(),
        }
    }

    pub fn contains_secret(&self) -> bool {
        match self {
            ResolvedValue::Secret(_) => true,
            ResolvedValue::List(items) => items.iter().any(ResolvedValue::contains_secret),
            ResolvedValue::Map(entries) => entries.values().any(ResolvedValue::contains_secret),
            _ => false,
        }
    }
}

/// The property bag handed to a provider call.
#[derive(Debug, Clone, Default)]
pub struct ResolvedProperties(BTreeMap<String, ResolvedValue>);

impl ResolvedProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ResolvedValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ResolvedValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResolvedValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.expose())).collect())
    }

    pub fn redacted(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.redacted())).collect())
    }
}

/// Output attributes reported by a provider after create/update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputAttributes(BTreeMap<String, serde_json::Value>);

impl OutputAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Look up a dotted attribute path; numeric segments index arrays.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                serde_json::Value::Object(map) => map.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

/// What a create-or-update call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutcome {
    pub change: ChangeKind,
    pub outputs: OutputAttributes,
}

impl ProviderOutcome {
    pub fn new(change: ChangeKind, outputs: OutputAttributes) -> Self {
        Self { change, outputs }
    }
}

/// Trait for cloud control-plane backends.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    /// Create the resource, or update it in place when it already exists.
    ///
    /// Fails with `ReplacementRequired` when an immutable property changed,
    /// and with `Validation`, `Conflict`, `Permission`, `Throttled` or
    /// `Transient` as the control plane reports.
    async fn create_or_update(
        &self,
        kind: ResourceKind,
        id: &NodeId,
        properties: &ResolvedProperties,
    ) -> Result<ProviderOutcome>;

    /// Delete a resource. `NotFound` is treated as success by callers.
    async fn delete(&self, kind: ResourceKind, id: &NodeId) -> Result<()>;

    /// Current outputs of a resource, or `None` when it does not exist.
    async fn describe(&self, kind: ResourceKind, id: &NodeId) -> Result<Option<OutputAttributes>>;
}
