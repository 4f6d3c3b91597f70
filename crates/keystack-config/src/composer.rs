//! Stack composer.
//!
//! Turns a [`TopologySpec`] into resource nodes ready for the graph builder.
//! Pool ownership is checked here and the ordering constraints that carry
//! no data reference are emitted as explicit dependencies: a client waits
//! for every provider it supports and, for hosted UI, for the pool's domain.

use crate::topology::{
    BucketSpec, ClientSpec, CodeSpec, DeploymentSpec, DomainSpec, FunctionSpec, PoolSpec,
    ProviderSpec, TopologySpec, TriggerSpec, ValueSpec,
};
use crate::{ConfigError, ConfigResult};
use keystack_core::{PropertyValue, ResourceKind, ResourceNode, SecretReference};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Provider name clients use for the pool's own sign-in.
const COGNITO: &str = "COGNITO";

/// Compose a topology into resource nodes, in the order the file declares
/// them. The scheduler breaks ties by this order.
pub fn compose(spec: &TopologySpec) -> ConfigResult<Vec<ResourceNode>> {
    StackComposer::new(spec).compose()
}

pub struct StackComposer<'a> {
    spec: &'a TopologySpec,
}

impl<'a> StackComposer<'a> {
    pub fn new(spec: &'a TopologySpec) -> Self {
        Self { spec }
    }

    pub fn compose(&self) -> ConfigResult<Vec<ResourceNode>> {
        self.validate()?;

        let spec = self.spec;
        let mut nodes = Vec::new();
        nodes.extend(spec.pools.iter().map(|p| self.pool(p)));
        nodes.extend(spec.domains.iter().map(domain));
        nodes.extend(spec.providers.iter().map(provider));
        for client in &spec.clients {
            nodes.push(self.client(client)?);
        }
        nodes.extend(spec.buckets.iter().map(bucket));
        nodes.extend(spec.deployments.iter().map(deployment));
        nodes.extend(spec.functions.iter().map(function));
        nodes.extend(spec.triggers.iter().map(trigger));

        // Ids missing from the declaration order keep their per-kind position
        // after every declared one.
        let position: HashMap<&str, usize> = spec
            .declaration_order
            .iter()
            .enumerate()
            .map(|(index, id)| (id.as_str(), index))
            .collect();
        nodes.sort_by_key(|node| {
            position
                .get(node.id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });

        debug!(topology = %spec.name, nodes = nodes.len(), "Composed topology");
        Ok(nodes)
    }

    fn validate(&self) -> ConfigResult<()> {
        let spec = self.spec;

        let mut ids = HashSet::new();
        let all_ids = spec
            .pools
            .iter()
            .map(|p| &p.id)
            .chain(spec.domains.iter().map(|d| &d.id))
            .chain(spec.providers.iter().map(|p| &p.id))
            .chain(spec.clients.iter().map(|c| &c.id))
            .chain(spec.buckets.iter().map(|b| &b.id))
            .chain(spec.deployments.iter().map(|d| &d.id))
            .chain(spec.functions.iter().map(|f| &f.id))
            .chain(spec.triggers.iter().map(|t| &t.id));
        for id in all_ids {
            if !ids.insert(id.as_str()) {
                return Err(ConfigError::Duplicate(format!("resource id '{id}'")));
            }
        }

        if spec.domains.len() > 1 {
            return Err(ConfigError::Duplicate(format!(
                "domain: a topology declares at most one, found {}",
                spec.domains.len()
            )));
        }

        let pools: HashSet<&str> = spec.pools.iter().map(|p| p.id.as_str()).collect();
        let check_pool = |owner: &str, pool: &str| {
            if pools.contains(pool) {
                Ok(())
            } else {
                Err(ConfigError::InvalidReference(format!(
                    "'{owner}' is bound to unknown pool '{pool}'"
                )))
            }
        };
        for d in &spec.domains {
            check_pool(&d.id, &d.pool)?;
        }
        for p in &spec.providers {
            check_pool(&p.id, &p.pool)?;
            if p.provider_type.needs_name() && p.provider_name.is_none() {
                return Err(ConfigError::MissingField(format!(
                    "name on provider '{}'",
                    p.id
                )));
            }
        }
        for c in &spec.clients {
            check_pool(&c.id, &c.pool)?;
        }
        for t in &spec.triggers {
            check_pool(&t.id, &t.pool)?;
            if !spec.functions.iter().any(|f| f.id == t.function) {
                return Err(ConfigError::InvalidReference(format!(
                    "trigger '{}' binds unknown function '{}'",
                    t.id, t.function
                )));
            }
        }

        let buckets: HashSet<&str> = spec.buckets.iter().map(|b| b.id.as_str()).collect();
        for d in &spec.deployments {
            if !buckets.contains(d.bucket.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "deployment '{}' targets unknown bucket '{}'",
                    d.id, d.bucket
                )));
            }
        }
        for f in &spec.functions {
            if let CodeSpec::Bucket { bucket, .. } = &f.code {
                if !buckets.contains(bucket.as_str()) {
                    return Err(ConfigError::InvalidReference(format!(
                        "function '{}' loads code from unknown bucket '{bucket}'",
                        f.id
                    )));
                }
            }
        }

        Ok(())
    }

    fn pool(&self, pool: &PoolSpec) -> ResourceNode {
        let name = pool
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.spec.name, pool.id));
        let mut node = ResourceNode::new(pool.id.as_str(), ResourceKind::Pool)
            .with_property("poolName", PropertyValue::literal(name))
            .with_property(
                "signInCaseSensitive",
                PropertyValue::literal(pool.sign_in_case_sensitive),
            );

        if let Some(enabled) = pool.self_sign_up {
            node = node.with_property("selfSignUpEnabled", PropertyValue::literal(enabled));
        }
        if !pool.standard_attributes.is_empty() {
            let attributes: serde_json::Map<String, serde_json::Value> = pool
                .standard_attributes
                .iter()
                .map(|a| {
                    (
                        a.name.clone(),
                        json!({ "required": a.required, "mutable": a.mutable }),
                    )
                })
                .collect();
            node = node.with_property("standardAttributes", PropertyValue::literal(attributes));
        }
        if !pool.custom_attributes.is_empty() {
            let attributes: serde_json::Map<String, serde_json::Value> = pool
                .custom_attributes
                .iter()
                .map(|a| {
                    (
                        a.name.clone(),
                        json!({
                            "type": a.data_type,
                            "minLen": a.min_len,
                            "maxLen": a.max_len,
                            "mutable": a.mutable,
                        }),
                    )
                })
                .collect();
            node = node.with_property("customAttributes", PropertyValue::literal(attributes));
        }

        with_dependencies(node, &pool.depends_on)
    }

    fn client(&self, client: &ClientSpec) -> ConfigResult<ResourceNode> {
        let mut supported = Vec::new();
        let mut provider_deps = Vec::new();

        for wanted in &client.supported_providers {
            if wanted.eq_ignore_ascii_case("cognito") {
                supported.push(COGNITO.to_string());
                continue;
            }

            let matches: Vec<&ProviderSpec> = self
                .spec
                .providers
                .iter()
                .filter(|p| p.pool == client.pool)
                .filter(|p| {
                    p.id == *wanted
                        || p.effective_name().eq_ignore_ascii_case(wanted)
                        || crate::topology::ProviderType::parse(wanted) == Some(p.provider_type)
                })
                .collect();
            if matches.is_empty() {
                return Err(ConfigError::InvalidReference(format!(
                    "client '{}' supports provider '{wanted}' which is not attached to pool '{}'",
                    client.id, client.pool
                )));
            }
            for p in matches {
                let name = p.effective_name().to_string();
                if !supported.contains(&name) {
                    supported.push(name);
                }
                if !provider_deps.contains(&p.id) {
                    provider_deps.push(p.id.clone());
                }
            }
        }

        let mut node = ResourceNode::new(client.id.as_str(), ResourceKind::Client)
            .with_property("userPoolId", PropertyValue::reference(client.pool.as_str(), "poolId"))
            .with_property(
                "clientName",
                PropertyValue::literal(client.name.clone().unwrap_or_else(|| client.id.clone())),
            )
            .with_property("generateSecret", PropertyValue::literal(client.generate_secret));

        let lists = [
            ("authFlows", &client.auth_flows),
            ("supportedIdentityProviders", &supported),
            ("callbackUrls", &client.callback_urls),
            ("logoutUrls", &client.logout_urls),
            ("oauthScopes", &client.oauth_scopes),
        ];
        for (key, values) in lists {
            if !values.is_empty() {
                node = node.with_property(key, PropertyValue::literal(values.clone()));
            }
        }

        let validities = [
            ("authSessionValidity", client.auth_session_validity),
            ("accessTokenValidity", client.access_token_validity),
            ("idTokenValidity", client.id_token_validity),
            ("refreshTokenValidity", client.refresh_token_validity),
        ];
        for (key, validity) in validities {
            if let Some(duration) = validity {
                node = node.with_property(key, PropertyValue::literal(minutes(duration)));
            }
        }

        for provider in provider_deps {
            node = node.depends_on(provider);
        }

        if client.hosted_ui {
            let domain = self
                .spec
                .domains
                .iter()
                .find(|d| d.pool == client.pool)
                .ok_or_else(|| {
                    ConfigError::InvalidReference(format!(
                        "client '{}' uses the hosted UI but pool '{}' has no domain",
                        client.id, client.pool
                    ))
                })?;
            node = node.depends_on(domain.id.as_str());
        }

        Ok(with_dependencies(node, &client.depends_on))
    }
}

fn domain(domain: &DomainSpec) -> ResourceNode {
    let mut node = ResourceNode::new(domain.id.as_str(), ResourceKind::Domain)
        .with_property("userPoolId", PropertyValue::reference(domain.pool.as_str(), "poolId"))
        .with_property("domainPrefix", PropertyValue::literal(domain.prefix.clone()));
    if let Some(custom) = &domain.custom_domain {
        node = node.with_property("customDomain", PropertyValue::literal(custom.clone()));
    }
    if let Some(arn) = &domain.certificate_arn {
        node = node.with_property("certificateArn", PropertyValue::literal(arn.clone()));
    }
    with_dependencies(node, &domain.depends_on)
}

fn provider(provider: &ProviderSpec) -> ResourceNode {
    let mut node = ResourceNode::new(provider.id.as_str(), ResourceKind::IdentityProvider)
        .with_property("userPoolId", PropertyValue::reference(provider.pool.as_str(), "poolId"))
        .with_property(
            "providerType",
            PropertyValue::literal(provider.provider_type.service_name()),
        )
        .with_property("clientId", PropertyValue::literal(provider.client_id.clone()));

    if let Some(name) = &provider.provider_name {
        node = node.with_property("providerName", PropertyValue::literal(name.clone()));
    }
    let secret = &provider.secret;
    let reference = SecretReference::new(secret.store.clone(), secret.key.clone(), secret.mode);
    node = node.with_property("clientSecret", reference.into());
    if !provider.attribute_mapping.is_empty() {
        node = node.with_property(
            "attributeMapping",
            PropertyValue::literal(json!(provider.attribute_mapping)),
        );
    }
    if !provider.scopes.is_empty() {
        node = node.with_property("scopes", PropertyValue::literal(provider.scopes.clone()));
    }
    with_dependencies(node, &provider.depends_on)
}

fn bucket(bucket: &BucketSpec) -> ResourceNode {
    let node = ResourceNode::new(bucket.id.as_str(), ResourceKind::StorageBucket)
        .with_property("bucketName", PropertyValue::literal(bucket.name.clone()))
        .with_property("versioned", PropertyValue::literal(bucket.versioned))
        .with_property("publicReadAccess", PropertyValue::literal(bucket.public_read));
    with_dependencies(node, &bucket.depends_on)
}

fn deployment(deployment: &DeploymentSpec) -> ResourceNode {
    let mut node = ResourceNode::new(deployment.id.as_str(), ResourceKind::Deployment)
        .with_property(
            "destinationBucket",
            PropertyValue::reference(deployment.bucket.as_str(), "bucketName"),
        )
        .with_property("sources", PropertyValue::literal(deployment.sources.clone()))
        .with_property("extract", PropertyValue::literal(deployment.extract))
        .with_property(
            "outputObjectKeys",
            PropertyValue::literal(deployment.output_object_keys),
        );
    if let Some(prefix) = &deployment.key_prefix {
        node = node.with_property("destinationKeyPrefix", PropertyValue::literal(prefix.clone()));
    }
    with_dependencies(node, &deployment.depends_on)
}

fn function(function: &FunctionSpec) -> ResourceNode {
    let code = match &function.code {
        CodeSpec::Path(path) => PropertyValue::Map(BTreeMap::from([(
            "path".to_string(),
            PropertyValue::literal(path.clone()),
        )])),
        CodeSpec::Bucket { bucket, key } => PropertyValue::Map(BTreeMap::from([
            (
                "bucket".to_string(),
                PropertyValue::reference(bucket.as_str(), "bucketName"),
            ),
            ("key".to_string(), value(key)),
        ])),
    };

    let mut node = ResourceNode::new(function.id.as_str(), ResourceKind::ComputeFunction)
        .with_property("runtime", PropertyValue::literal(function.runtime.clone()))
        .with_property("handler", PropertyValue::literal(function.handler.clone()))
        .with_property("code", code);

    if !function.environment.is_empty() {
        let environment = function
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), value(v)))
            .collect();
        node = node.with_property("environment", PropertyValue::Map(environment));
    }
    if let Some(timeout) = function.timeout_seconds {
        node = node.with_property("timeoutSeconds", PropertyValue::literal(timeout));
    }
    if let Some(memory) = function.memory_size {
        node = node.with_property("memorySize", PropertyValue::literal(memory));
    }
    if !function.policies.is_empty() {
        let statements = function
            .policies
            .iter()
            .map(|p| {
                PropertyValue::Map(BTreeMap::from([
                    ("effect".to_string(), PropertyValue::literal(p.effect.clone())),
                    ("actions".to_string(), PropertyValue::literal(p.actions.clone())),
                    (
                        "resources".to_string(),
                        PropertyValue::List(p.resources.iter().map(value).collect()),
                    ),
                ]))
            })
            .collect();
        node = node.with_property("policyStatements", PropertyValue::List(statements));
    }
    with_dependencies(node, &function.depends_on)
}

fn trigger(trigger: &TriggerSpec) -> ResourceNode {
    let node = ResourceNode::new(trigger.id.as_str(), ResourceKind::Trigger)
        .with_property("userPoolId", PropertyValue::reference(trigger.pool.as_str(), "poolId"))
        .with_property("event", PropertyValue::literal(trigger.event.clone()))
        .with_property(
            "functionArn",
            PropertyValue::reference(trigger.function.as_str(), "arn"),
        );
    with_dependencies(node, &trigger.depends_on)
}

fn value(spec: &ValueSpec) -> PropertyValue {
    match spec {
        ValueSpec::Literal(s) => PropertyValue::literal(s.clone()),
        ValueSpec::Reference { node, attribute } => {
            PropertyValue::reference(node.as_str(), attribute.as_str())
        }
    }
}

fn with_dependencies(node: ResourceNode, depends_on: &[String]) -> ResourceNode {
    depends_on
        .iter()
        .fold(node, |node, dep| node.depends_on(dep.as_str()))
}

fn minutes(duration: Duration) -> u64 {
    duration.as_secs() / 60
}
