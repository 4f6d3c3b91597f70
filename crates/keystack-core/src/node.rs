//! Resource nodes, kinds and property values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::secret::SecretReference;
use crate::{Error, NodeId, Result};

/// The kind of a provisionable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Pool,
    Domain,
    IdentityProvider,
    Client,
    Trigger,
    StorageBucket,
    Deployment,
    ComputeFunction,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Pool => write!(f, "pool"),
            ResourceKind::Domain => write!(f, "domain"),
            ResourceKind::IdentityProvider => write!(f, "identity_provider"),
            ResourceKind::Client => write!(f, "client"),
            ResourceKind::Trigger => write!(f, "trigger"),
            ResourceKind::StorageBucket => write!(f, "storage_bucket"),
            ResourceKind::Deployment => write!(f, "deployment"),
            ResourceKind::ComputeFunction => write!(f, "compute_function"),
        }
    }
}

/// Allowed property names for a kind.
#[derive(Debug, Clone, Copy)]
pub struct KindSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    /// Properties that cannot change in place on a live resource.
    pub immutable: &'static [&'static str],
}

impl KindSchema {
    pub fn allows(&self, key: &str) -> bool {
        self.required.contains(&key) || self.optional.contains(&key)
    }

    pub fn is_immutable(&self, key: &str) -> bool {
        self.immutable.contains(&key)
    }
}

const POOL_SCHEMA: KindSchema = KindSchema {
    required: &[],
    optional: &[
        "poolName",
        "signInCaseSensitive",
        "selfSignUpEnabled",
        "standardAttributes",
        "customAttributes",
    ],
    immutable: &["poolName", "signInCaseSensitive", "standardAttributes"],
};

const DOMAIN_SCHEMA: KindSchema = KindSchema {
    required: &["userPoolId", "domainPrefix"],
    optional: &["customDomain", "certificateArn"],
    immutable: &["userPoolId", "domainPrefix", "customDomain"],
};

const IDENTITY_PROVIDER_SCHEMA: KindSchema = KindSchema {
    required: &["userPoolId", "providerType", "clientId"],
    optional: &["providerName", "clientSecret", "attributeMapping", "scopes"],
    immutable: &["userPoolId", "providerType", "providerName"],
};

const CLIENT_SCHEMA: KindSchema = KindSchema {
    required: &["userPoolId"],
    optional: &[
        "clientName",
        "authFlows",
        "supportedIdentityProviders",
        "generateSecret",
        "callbackUrls",
        "logoutUrls",
        "oauthScopes",
        "authSessionValidity",
        "accessTokenValidity",
        "idTokenValidity",
        "refreshTokenValidity",
    ],
    immutable: &["userPoolId", "generateSecret"],
};

const TRIGGER_SCHEMA: KindSchema = KindSchema {
    required: &["userPoolId", "event", "functionArn"],
    optional: &[],
    immutable: &["userPoolId", "event"],
};

const STORAGE_BUCKET_SCHEMA: KindSchema = KindSchema {
    required: &["bucketName"],
    optional: &["versioned", "publicReadAccess"],
    immutable: &["bucketName"],
};

const DEPLOYMENT_SCHEMA: KindSchema = KindSchema {
    required: &["destinationBucket", "sources"],
    optional: &["extract", "destinationKeyPrefix", "outputObjectKeys"],
    immutable: &["destinationBucket"],
};

const COMPUTE_FUNCTION_SCHEMA: KindSchema = KindSchema {
    required: &["runtime", "handler", "code"],
    optional: &["environment", "timeoutSeconds", "memorySize", "policyStatements"],
    immutable: &[],
};

impl ResourceKind {
    pub fn schema(&self) -> &'static KindSchema {
        match self {
            ResourceKind::Pool => &POOL_SCHEMA,
            ResourceKind::Domain => &DOMAIN_SCHEMA,
            ResourceKind::IdentityProvider => &IDENTITY_PROVIDER_SCHEMA,
            ResourceKind::Client => &CLIENT_SCHEMA,
            ResourceKind::Trigger => &TRIGGER_SCHEMA,
            ResourceKind::StorageBucket => &STORAGE_BUCKET_SCHEMA,
            ResourceKind::Deployment => &DEPLOYMENT_SCHEMA,
            ResourceKind::ComputeFunction => &COMPUTE_FUNCTION_SCHEMA,
        }
    }
}

/// A reference to an output attribute of another node.
///
/// `attribute` is a dotted path into the node's outputs; numeric segments
/// index arrays (`objectKeys.0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRef {
    pub node: NodeId,
    pub attribute: String,
}

impl AttributeRef {
    pub fn new(node: impl Into<NodeId>, attribute: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            attribute: attribute.into(),
        }
    }
}

impl std::fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.attribute)
    }
}

/// A property value as declared, before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Literal(serde_json::Value),
    Reference(AttributeRef),
    Secret(SecretReference),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        PropertyValue::Literal(value.into())
    }

    pub fn reference(node: impl Into<NodeId>, attribute: impl Into<String>) -> Self {
        PropertyValue::Reference(AttributeRef::new(node, attribute))
    }

    /// Visit every reference nested in this value, with its property path.
    fn collect_references<'a>(&'a self, path: String, out: &mut Vec<(String, &'a AttributeRef)>) {
        match self {
            PropertyValue::Literal(_) | PropertyValue::Secret(_) => {}
            PropertyValue::Reference(r) => out.push((path, r)),
            PropertyValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_references(format!("{path}.{i}"), out);
                }
            }
            PropertyValue::Map(entries) => {
                for (key, item) in entries {
                    item.collect_references(format!("{path}.{key}"), out);
                }
            }
        }
    }

    fn collect_secrets<'a>(&'a self, out: &mut Vec<&'a SecretReference>) {
        match self {
            PropertyValue::Secret(s) => out.push(s),
            PropertyValue::List(items) => items.iter().for_each(|i| i.collect_secrets(out)),
            PropertyValue::Map(entries) => entries.values().for_each(|i| i.collect_secrets(out)),
            _ => {}
        }
    }
}

impl From<SecretReference> for PropertyValue {
    fn from(secret: SecretReference) -> Self {
        PropertyValue::Secret(secret)
    }
}

impl From<AttributeRef> for PropertyValue {
    fn from(reference: AttributeRef) -> Self {
        PropertyValue::Reference(reference)
    }
}

/// A typed description of one provisionable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: NodeId,
    pub kind: ResourceKind,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Ordering constraints with no corresponding data reference.
    #[serde(default)]
    pub explicit_dependencies: BTreeSet<NodeId>,
}

impl ResourceNode {
    pub fn new(id: impl Into<NodeId>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: BTreeMap::new(),
            explicit_dependencies: BTreeSet::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn depends_on(mut self, id: impl Into<NodeId>) -> Self {
        self.explicit_dependencies.insert(id.into());
        self
    }

    /// All attribute references in the property bag, keyed by property path.
    pub fn references(&self) -> Vec<(String, &AttributeRef)> {
        let mut out = Vec::new();
        for (key, value) in &self.properties {
            value.collect_references(key.clone(), &mut out);
        }
        out
    }

    pub fn secret_references(&self) -> Vec<&SecretReference> {
        let mut out = Vec::new();
        for value in self.properties.values() {
            value.collect_secrets(&mut out);
        }
        out
    }

    /// Check the property bag against the kind's schema.
    pub fn validate_schema(&self) -> Result<()> {
        let schema = self.kind.schema();

        let missing: Vec<&str> = schema
            .required
            .iter()
            .copied()
            .filter(|key| !self.properties.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Schema {
                node: self.id.clone(),
                message: format!("missing required properties: {}", missing.join(", ")),
            });
        }

        let unknown: Vec<&str> = self
            .properties
            .keys()
            .map(String::as_str)
            .filter(|key| !schema.allows(key))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::Schema {
                node: self.id.clone(),
                message: format!(
                    "properties not allowed for {}: {}",
                    self.kind,
                    unknown.join(", ")
                ),
            });
        }

        Ok(())
    }
}
