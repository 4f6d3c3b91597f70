//! File-backed resource provider.
//!
//! Resources live in a JSON state file. Only redacted properties are
//! written, next to a salted SHA-256 fingerprint per property, so changes
//! to secret-valued properties are still detected without storing them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystack_core::{
    ChangeKind, Error, NodeId, OutputAttributes, ProviderOutcome, ResolvedProperties,
    ResourceKind, ResourceProvider, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

const STATE_VERSION: u32 = 1;

/// One resource as recorded in the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: NodeId,
    pub kind: ResourceKind,
    /// Properties with eager secrets redacted.
    pub properties: Value,
    pub fingerprints: BTreeMap<String, String>,
    pub outputs: OutputAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    resources: BTreeMap<NodeId, StoredResource>,
}

impl StateFile {
    fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            resources: BTreeMap::new(),
        }
    }
}

/// Resource provider that simulates the control plane locally.
pub struct LocalProvider {
    path: Option<PathBuf>,
    account: String,
    region: String,
    state: Mutex<StateFile>,
}

impl LocalProvider {
    /// A provider whose state is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            account: "000000000000".to_string(),
            region: "local-1".to_string(),
            state: Mutex::new(StateFile::empty()),
        }
    }

    /// Open (or start) the state file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StateFile>(&bytes).map_err(|e| {
                Error::Validation(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::empty(),
            Err(e) => return Err(io_error(&path, e)),
        };

        if state.version > STATE_VERSION {
            return Err(Error::Validation(format!(
                "state file {} has version {}, newest supported is {STATE_VERSION}",
                path.display(),
                state.version
            )));
        }

        debug!(path = %path.display(), resources = state.resources.len(), "Opened state file");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
            ..Self::in_memory()
        })
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All recorded resources, ordered by id.
    pub async fn resources(&self) -> Vec<StoredResource> {
        self.state.lock().await.resources.values().cloned().collect()
    }

    pub async fn get(&self, id: &NodeId) -> Option<StoredResource> {
        self.state.lock().await.resources.get(id).cloned()
    }

    async fn persist(&self, state: &StateFile) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Internal(format!("failed to encode state: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(())
    }

    /// Synthesize the outputs the control plane would report.
    fn outputs(&self, kind: ResourceKind, id: &NodeId, properties: &Value) -> OutputAttributes {
        let (account, region) = (&self.account, &self.region);
        let prop = |key: &str| properties.get(key).and_then(Value::as_str);

        match kind {
            ResourceKind::Pool => {
                let pool_id = format!("{region}_{}", short_hash(id.as_str(), 9));
                OutputAttributes::new()
                    .with("poolName", prop("poolName").unwrap_or(id.as_str()))
                    .with(
                        "arn",
                        format!("arn:local:cognito-idp:{region}:{account}:userpool/{pool_id}"),
                    )
                    .with("poolId", pool_id)
            }
            ResourceKind::Domain => {
                let domain = match prop("customDomain") {
                    Some(custom) => custom.to_string(),
                    None => format!(
                        "{}.auth.{region}.local",
                        prop("domainPrefix").unwrap_or(id.as_str())
                    ),
                };
                OutputAttributes::new()
                    .with("url", format!("https://{domain}"))
                    .with("domain", domain)
            }
            ResourceKind::IdentityProvider => {
                let provider_type = prop("providerType").unwrap_or("OIDC");
                OutputAttributes::new()
                    .with("providerName", prop("providerName").unwrap_or(provider_type))
                    .with("providerType", provider_type)
            }
            ResourceKind::Client => OutputAttributes::new()
                .with("clientId", short_hash(id.as_str(), 26))
                .with("clientName", prop("clientName").unwrap_or(id.as_str())),
            ResourceKind::Trigger => OutputAttributes::new()
                .with("event", prop("event").unwrap_or_default())
                .with("triggerId", short_hash(id.as_str(), 12)),
            ResourceKind::StorageBucket => {
                let name = prop("bucketName").unwrap_or(id.as_str());
                OutputAttributes::new()
                    .with("arn", format!("arn:local:s3:::{name}"))
                    .with("domainName", format!("{name}.s3.{region}.local"))
                    .with("bucketName", name)
            }
            ResourceKind::Deployment => {
                let mut outputs = OutputAttributes::new()
                    .with("destinationBucket", prop("destinationBucket").unwrap_or_default());
                if properties.get("outputObjectKeys").and_then(Value::as_bool) != Some(false) {
                    let prefix = prop("destinationKeyPrefix").unwrap_or_default();
                    let keys: Vec<String> = properties
                        .get("sources")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                        .filter_map(Value::as_str)
                        .map(|source| format!("{prefix}{}.zip", short_hash(source, 32)))
                        .collect();
                    outputs.insert("objectKeys", keys);
                }
                outputs
            }
            ResourceKind::ComputeFunction => {
                let code = properties.get("code").map(Value::to_string).unwrap_or_default();
                OutputAttributes::new()
                    .with(
                        "arn",
                        format!("arn:local:lambda:{region}:{account}:function:{id}"),
                    )
                    .with("functionName", id.as_str())
                    .with("version", short_hash(&code, 12))
            }
        }
    }
}

#[async_trait]
impl ResourceProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_or_update(
        &self,
        kind: ResourceKind,
        id: &NodeId,
        properties: &ResolvedProperties,
    ) -> Result<ProviderOutcome> {
        let redacted = properties.redacted();
        let fingerprints = fingerprint(id, properties);
        let now = Utc::now();

        // Changes go to a copy that replaces the live state only once it is on disk.
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let (change, outputs) = match next.resources.entry(id.clone()) {
            Entry::Vacant(slot) => {
                let outputs = self.outputs(kind, id, &redacted);
                slot.insert(StoredResource {
                    id: id.clone(),
                    kind,
                    properties: redacted,
                    fingerprints,
                    outputs: outputs.clone(),
                    created_at: now,
                    updated_at: now,
                });
                (ChangeKind::Created, outputs)
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if existing.kind != kind {
                    return Err(Error::Conflict(format!(
                        "'{id}' already exists as a {}",
                        existing.kind
                    )));
                }
                if existing.fingerprints == fingerprints {
                    debug!(node = %id, "No changes");
                    return Ok(ProviderOutcome::new(
                        ChangeKind::Unchanged,
                        existing.outputs.clone(),
                    ));
                }

                let immutable: Vec<String> = changed_keys(&existing.fingerprints, &fingerprints)
                    .into_iter()
                    .filter(|key| kind.schema().is_immutable(key))
                    .collect();
                if !immutable.is_empty() {
                    return Err(Error::ReplacementRequired {
                        node: id.clone(),
                        properties: immutable,
                    });
                }

                let outputs = self.outputs(kind, id, &redacted);
                existing.properties = redacted;
                existing.fingerprints = fingerprints;
                existing.outputs = outputs.clone();
                existing.updated_at = now;
                (ChangeKind::Updated, outputs)
            }
        };

        self.persist(&next).await?;
        *state = next;
        info!(node = %id, kind = %kind, change = %change, "Applied resource");
        Ok(ProviderOutcome::new(change, outputs))
    }

    async fn delete(&self, kind: ResourceKind, id: &NodeId) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.resources.get(id) {
            None => return Err(Error::NotFound(format!("{kind} '{id}'"))),
            Some(existing) if existing.kind != kind => {
                return Err(Error::Conflict(format!(
                    "'{id}' is a {}, not a {kind}",
                    existing.kind
                )));
            }
            Some(_) => {}
        }

        let mut next = state.clone();
        next.resources.remove(id);
        self.persist(&next).await?;
        *state = next;
        info!(node = %id, kind = %kind, "Deleted resource");
        Ok(())
    }

    async fn describe(&self, kind: ResourceKind, id: &NodeId) -> Result<Option<OutputAttributes>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .get(id)
            .filter(|r| r.kind == kind)
            .map(|r| r.outputs.clone()))
    }
}

/// Salted per-property digest of the exposed values.
fn fingerprint(id: &NodeId, properties: &ResolvedProperties) -> BTreeMap<String, String> {
    properties
        .iter()
        .map(|(key, value)| {
            let mut hasher = Sha256::new();
            hasher.update(id.as_str().as_bytes());
            hasher.update([0]);
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.expose().to_string().as_bytes());
            (key.clone(), hex::encode(hasher.finalize()))
        })
        .collect()
}

fn changed_keys(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<String> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect()
}

fn short_hash(input: &str, len: usize) -> String {
    let mut digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest.truncate(len);
    digest
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::Internal(format!("{}: {e}", path.display()))
}
