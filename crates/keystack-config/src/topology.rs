//! Topology file parsing.
//!
//! A topology is a KDL document declaring identity pools, their providers,
//! domains, clients and triggers, plus the buckets, deployments and compute
//! functions around them. Every string literal passes through
//! [`VariableContext::interpolate`] so one file serves every stage.

use crate::settings::{ExecutorSettings, parse_settings};
use crate::{ConfigError, ConfigResult, VariableContext};
use keystack_core::ResolutionMode;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// A parsed topology file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySpec {
    pub name: String,
    pub settings: ExecutorSettings,
    pub pools: Vec<PoolSpec>,
    pub domains: Vec<DomainSpec>,
    pub providers: Vec<ProviderSpec>,
    pub clients: Vec<ClientSpec>,
    pub functions: Vec<FunctionSpec>,
    pub triggers: Vec<TriggerSpec>,
    pub buckets: Vec<BucketSpec>,
    pub deployments: Vec<DeploymentSpec>,
    /// Resource ids in the order the file declares them.
    #[serde(default)]
    pub declaration_order: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    pub name: Option<String>,
    pub sign_in_case_sensitive: bool,
    pub self_sign_up: Option<bool>,
    pub standard_attributes: Vec<StandardAttribute>,
    pub custom_attributes: Vec<CustomAttribute>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardAttribute {
    pub name: String,
    pub required: bool,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAttribute {
    pub name: String,
    /// `string` or `number`.
    pub data_type: String,
    pub min_len: Option<u32>,
    pub max_len: Option<u32>,
    pub mutable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSpec {
    pub id: String,
    pub pool: String,
    pub prefix: String,
    pub custom_domain: Option<String>,
    pub certificate_arn: Option<String>,
    pub depends_on: Vec<String>,
}

/// External identity provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Google,
    Facebook,
    Amazon,
    Apple,
    Oidc,
    Saml,
}

impl ProviderType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Some(ProviderType::Google),
            "facebook" => Some(ProviderType::Facebook),
            "amazon" | "loginwithamazon" => Some(ProviderType::Amazon),
            "apple" | "signinwithapple" => Some(ProviderType::Apple),
            "oidc" => Some(ProviderType::Oidc),
            "saml" => Some(ProviderType::Saml),
            _ => None,
        }
    }

    /// The name the identity service uses for this family.
    pub fn service_name(&self) -> &'static str {
        match self {
            ProviderType::Google => "Google",
            ProviderType::Facebook => "Facebook",
            ProviderType::Amazon => "LoginWithAmazon",
            ProviderType::Apple => "SignInWithApple",
            ProviderType::Oidc => "OIDC",
            ProviderType::Saml => "SAML",
        }
    }

    /// OIDC and SAML providers have no implied name.
    pub fn needs_name(&self) -> bool {
        matches!(self, ProviderType::Oidc | ProviderType::Saml)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub store: String,
    pub key: Option<String>,
    pub mode: ResolutionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: String,
    pub pool: String,
    pub provider_type: ProviderType,
    pub provider_name: Option<String>,
    pub client_id: String,
    pub secret: SecretSpec,
    pub attribute_mapping: BTreeMap<String, String>,
    pub scopes: Vec<String>,
    pub depends_on: Vec<String>,
}

impl ProviderSpec {
    /// Name clients use to list this provider as supported.
    pub fn effective_name(&self) -> &str {
        self.provider_name
            .as_deref()
            .unwrap_or_else(|| self.provider_type.service_name())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSpec {
    pub id: String,
    pub pool: String,
    pub name: Option<String>,
    pub auth_flows: Vec<String>,
    /// Provider ids, provider families, or `cognito`.
    pub supported_providers: Vec<String>,
    /// Hosted UI flows need the pool's domain in place first.
    pub hosted_ui: bool,
    pub generate_secret: bool,
    pub callback_urls: Vec<String>,
    pub logout_urls: Vec<String>,
    pub oauth_scopes: Vec<String>,
    pub auth_session_validity: Option<Duration>,
    pub access_token_validity: Option<Duration>,
    pub id_token_validity: Option<Duration>,
    pub refresh_token_validity: Option<Duration>,
    pub depends_on: Vec<String>,
}

/// A literal string or a reference to another node's output attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSpec {
    Literal(String),
    Reference { node: String, attribute: String },
}

impl ValueSpec {
    /// Parse `node.attribute[.path]`.
    pub fn reference(path: &str) -> Option<Self> {
        let (node, attribute) = path.split_once('.')?;
        if node.is_empty() || attribute.is_empty() {
            return None;
        }
        Some(ValueSpec::Reference {
            node: node.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSpec {
    /// Local asset directory or archive.
    Path(String),
    /// Object in a declared bucket.
    Bucket { bucket: String, key: ValueSpec },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatementSpec {
    pub effect: String,
    pub actions: Vec<String>,
    pub resources: Vec<ValueSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub id: String,
    pub runtime: String,
    pub handler: String,
    pub code: CodeSpec,
    pub environment: BTreeMap<String, ValueSpec>,
    pub timeout_seconds: Option<u32>,
    pub memory_size: Option<u32>,
    pub policies: Vec<PolicyStatementSpec>,
    pub depends_on: Vec<String>,
}

/// User pool lifecycle events a function can be bound to.
pub const TRIGGER_EVENTS: &[(&str, &str)] = &[
    ("pre-sign-up", "preSignUp"),
    ("post-confirmation", "postConfirmation"),
    ("pre-authentication", "preAuthentication"),
    ("post-authentication", "postAuthentication"),
    ("pre-token-generation", "preTokenGeneration"),
    ("custom-message", "customMessage"),
    ("define-auth-challenge", "defineAuthChallenge"),
    ("create-auth-challenge", "createAuthChallenge"),
    ("verify-auth-challenge-response", "verifyAuthChallengeResponse"),
    ("user-migration", "userMigration"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub id: String,
    pub pool: String,
    /// Service event name, e.g. `preSignUp`.
    pub event: String,
    pub function: String,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSpec {
    pub id: String,
    pub name: String,
    pub versioned: bool,
    pub public_read: bool,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub id: String,
    pub bucket: String,
    pub sources: Vec<String>,
    pub extract: bool,
    pub key_prefix: Option<String>,
    pub output_object_keys: bool,
    pub depends_on: Vec<String>,
}

/// Read and parse a topology file.
pub fn load_topology(path: impl AsRef<Path>, vars: VariableContext) -> ConfigResult<TopologySpec> {
    let text = std::fs::read_to_string(path.as_ref())?;
    parse_topology(&text, vars)
}

/// Parse a topology from KDL text.
///
/// The `topology` node is read first so `${topology.name}` is available to
/// every other node.
pub fn parse_topology(kdl: &str, mut vars: VariableContext) -> ConfigResult<TopologySpec> {
    let doc: KdlDocument = kdl.parse()?;

    let name = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "topology")
        .and_then(get_first_string_arg)
        .map(|n| vars.interpolate(&n))
        .ok_or_else(|| ConfigError::MissingField("topology name".to_string()))?;
    vars.topology_name = name.clone();

    let reader = Reader { vars: &vars };
    let mut spec = TopologySpec {
        name,
        ..Default::default()
    };
    let mut seen_settings = false;

    for node in doc.nodes() {
        let kind = node.name().value();
        match kind {
            "topology" => continue,
            "settings" => {
                if seen_settings {
                    return Err(ConfigError::Duplicate("settings block".to_string()));
                }
                seen_settings = true;
                spec.settings = parse_settings(node)?;
                continue;
            }
            "pool" => spec.pools.push(reader.pool(node)?),
            "domain" => spec.domains.push(reader.domain(node)?),
            "provider" => spec.providers.push(reader.provider(node)?),
            "client" => spec.clients.push(reader.client(node)?),
            "function" => spec.functions.push(reader.function(node)?),
            "trigger" => spec.triggers.push(reader.trigger(node)?),
            "bucket" => spec.buckets.push(reader.bucket(node)?),
            "deployment" => spec.deployments.push(reader.deployment(node)?),
            other => {
                warn!(node = other, "Ignoring unknown topology node");
                continue;
            }
        }
        spec.declaration_order.push(reader.id(node, kind)?);
    }

    debug!(
        topology = %spec.name,
        pools = spec.pools.len(),
        providers = spec.providers.len(),
        clients = spec.clients.len(),
        functions = spec.functions.len(),
        "Parsed topology"
    );
    Ok(spec)
}

/// Parse a duration literal such as `15m`, `1h` or `30d`. Validity
/// windows are whole minutes, so there is no seconds unit.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = s.split_at(split);
    let n: u64 = number.parse().ok()?;
    let secs = match unit {
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Node readers that interpolate every string they return.
struct Reader<'a> {
    vars: &'a VariableContext,
}

impl Reader<'_> {
    fn id(&self, node: &KdlNode, what: &str) -> ConfigResult<String> {
        get_first_string_arg(node)
            .map(|s| self.vars.interpolate(&s))
            .ok_or_else(|| ConfigError::MissingField(format!("{what} id")))
    }

    fn prop(&self, node: &KdlNode, name: &str) -> Option<String> {
        get_string_prop(node, name).map(|s| self.vars.interpolate(&s))
    }

    fn required_prop(&self, node: &KdlNode, id: &str, name: &str) -> ConfigResult<String> {
        self.prop(node, name)
            .ok_or_else(|| ConfigError::MissingField(format!("{name} on '{id}'")))
    }

    fn args(&self, node: &KdlNode) -> Vec<String> {
        self.vars.interpolate_vec(&get_all_string_args(node))
    }

    fn depends_on(&self, node: &KdlNode) -> Vec<String> {
        self.vars
            .interpolate_vec(&get_string_list_prop(node, "depends-on"))
    }

    /// A value node: `ref="node.attr"` or a literal argument at `index`.
    fn value(&self, node: &KdlNode, index: usize, field: &str) -> ConfigResult<ValueSpec> {
        if let Some(path) = self.prop(node, "ref") {
            return ValueSpec::reference(&path).ok_or_else(|| {
                ConfigError::invalid(field, format!("expected node.attribute, got \"{path}\""))
            });
        }
        self.args(node)
            .into_iter()
            .nth(index)
            .map(ValueSpec::Literal)
            .ok_or_else(|| ConfigError::MissingField(field.to_string()))
    }

    fn pool(&self, node: &KdlNode) -> ConfigResult<PoolSpec> {
        let id = self.id(node, "pool")?;
        let mut pool = PoolSpec {
            name: self.prop(node, "name"),
            sign_in_case_sensitive: false,
            self_sign_up: get_bool_prop(node, "self-sign-up"),
            standard_attributes: Vec::new(),
            custom_attributes: Vec::new(),
            depends_on: self.depends_on(node),
            id,
        };

        for child in children(node) {
            match child.name().value() {
                "sign-in-case-sensitive" => {
                    pool.sign_in_case_sensitive = get_first_bool_arg(child).unwrap_or(true);
                }
                "self-sign-up" => pool.self_sign_up = get_first_bool_arg(child),
                "standard-attribute" => {
                    let name = self.id(child, "standard-attribute")?;
                    pool.standard_attributes.push(StandardAttribute {
                        name,
                        required: get_bool_prop(child, "required").unwrap_or(false),
                        mutable: get_bool_prop(child, "mutable").unwrap_or(true),
                    });
                }
                "custom-attribute" => {
                    let name = self.id(child, "custom-attribute")?;
                    let data_type = self.prop(child, "type").unwrap_or_else(|| "string".into());
                    if !matches!(data_type.as_str(), "string" | "number") {
                        return Err(ConfigError::invalid(
                            format!("custom-attribute {name}"),
                            format!("unknown type \"{data_type}\""),
                        ));
                    }
                    pool.custom_attributes.push(CustomAttribute {
                        min_len: get_u32_prop(child, "min-len")?,
                        max_len: get_u32_prop(child, "max-len")?,
                        mutable: get_bool_prop(child, "mutable").unwrap_or(true),
                        name,
                        data_type,
                    });
                }
                "depends-on" => pool.depends_on.extend(self.args(child)),
                _ => {}
            }
        }

        Ok(pool)
    }

    fn domain(&self, node: &KdlNode) -> ConfigResult<DomainSpec> {
        let id = self.id(node, "domain")?;
        Ok(DomainSpec {
            pool: self.required_prop(node, &id, "pool")?,
            prefix: self.required_prop(node, &id, "prefix")?,
            custom_domain: self.prop(node, "custom-domain"),
            certificate_arn: self.prop(node, "certificate"),
            depends_on: self.depends_on(node),
            id,
        })
    }

    fn provider(&self, node: &KdlNode) -> ConfigResult<ProviderSpec> {
        let id = self.id(node, "provider")?;
        let type_name = self.required_prop(node, &id, "type")?;
        let provider_type = ProviderType::parse(&type_name).ok_or_else(|| {
            ConfigError::invalid(
                format!("type on '{id}'"),
                format!("unknown provider type \"{type_name}\""),
            )
        })?;

        let pool = self.required_prop(node, &id, "pool")?;
        let client_id = self.required_prop(node, &id, "client-id")?;
        let mut secret = None;
        let mut attribute_mapping = BTreeMap::new();
        let mut scopes = Vec::new();
        let mut depends_on = self.depends_on(node);

        for child in children(node) {
            match child.name().value() {
                "secret" => {
                    if secret.is_some() {
                        return Err(ConfigError::Duplicate(format!("secret on provider '{id}'")));
                    }
                    secret = Some(self.secret(child, &id)?);
                }
                "attribute-mapping" => {
                    for entry in child.entries() {
                        if let (Some(key), Some(value)) = (entry.name(), entry.value().as_string())
                        {
                            attribute_mapping
                                .insert(key.value().to_string(), self.vars.interpolate(value));
                        }
                    }
                }
                "scopes" => scopes = self.args(child),
                "depends-on" => depends_on.extend(self.args(child)),
                _ => {}
            }
        }

        let secret = secret
            .ok_or_else(|| ConfigError::MissingField(format!("secret on provider '{id}'")))?;
        Ok(ProviderSpec {
            pool,
            provider_type,
            provider_name: self.prop(node, "name"),
            client_id,
            secret,
            attribute_mapping,
            scopes,
            depends_on,
            id,
        })
    }

    fn secret(&self, node: &KdlNode, provider: &str) -> ConfigResult<SecretSpec> {
        let store = self.id(node, "secret store")?;
        let mode = match self.prop(node, "mode").as_deref() {
            None | Some("eager") => ResolutionMode::Eager,
            Some("deferred") => ResolutionMode::Deferred,
            Some(other) => {
                return Err(ConfigError::invalid(
                    format!("secret mode on '{provider}'"),
                    format!("expected \"eager\" or \"deferred\", got \"{other}\""),
                ));
            }
        };
        Ok(SecretSpec {
            store,
            key: self.prop(node, "key"),
            mode,
        })
    }

    fn client(&self, node: &KdlNode) -> ConfigResult<ClientSpec> {
        let id = self.id(node, "client")?;
        let mut client = ClientSpec {
            pool: self.required_prop(node, &id, "pool")?,
            name: self.prop(node, "name"),
            hosted_ui: get_bool_prop(node, "hosted-ui").unwrap_or(false),
            generate_secret: get_bool_prop(node, "generate-secret").unwrap_or(false),
            depends_on: self.depends_on(node),
            id,
            ..Default::default()
        };

        for child in children(node) {
            let field = child.name().value();
            match field {
                "auth-flows" => client.auth_flows = self.args(child),
                "supported-providers" => client.supported_providers = self.args(child),
                "callback-urls" => client.callback_urls = self.args(child),
                "logout-urls" => client.logout_urls = self.args(child),
                "oauth-scopes" => client.oauth_scopes = self.args(child),
                "auth-session-validity" => {
                    client.auth_session_validity = Some(self.duration(child)?)
                }
                "access-token-validity" => {
                    client.access_token_validity = Some(self.duration(child)?)
                }
                "id-token-validity" => client.id_token_validity = Some(self.duration(child)?),
                "refresh-token-validity" => {
                    client.refresh_token_validity = Some(self.duration(child)?)
                }
                "depends-on" => client.depends_on.extend(self.args(child)),
                _ => {}
            }
        }

        Ok(client)
    }

    fn duration(&self, node: &KdlNode) -> ConfigResult<Duration> {
        let field = node.name().value();
        let text = get_first_string_arg(node)
            .map(|s| self.vars.interpolate(&s))
            .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
        match parse_duration(&text) {
            Some(d) if !d.is_zero() => Ok(d),
            _ => Err(ConfigError::invalid(
                field,
                format!("expected a duration like 15m, 1h or 30d, got \"{text}\""),
            )),
        }
    }

    fn function(&self, node: &KdlNode) -> ConfigResult<FunctionSpec> {
        let id = self.id(node, "function")?;
        let runtime = self.required_prop(node, &id, "runtime")?;
        let handler = self.required_prop(node, &id, "handler")?;

        let mut code = None;
        let mut environment = BTreeMap::new();
        let mut policies = Vec::new();
        let mut depends_on = self.depends_on(node);

        for child in children(node) {
            match child.name().value() {
                "code" => code = Some(self.code(child, &id)?),
                "env" => {
                    let key = self.id(child, "env")?;
                    let value = self.value(child, 1, &format!("env {key} on '{id}'"))?;
                    environment.insert(key, value);
                }
                "policy" => policies.push(self.policy(child)?),
                "depends-on" => depends_on.extend(self.args(child)),
                _ => {}
            }
        }

        Ok(FunctionSpec {
            code: code.ok_or_else(|| ConfigError::MissingField(format!("code on '{id}'")))?,
            runtime,
            handler,
            environment,
            timeout_seconds: get_u32_prop(node, "timeout")?,
            memory_size: get_u32_prop(node, "memory")?,
            policies,
            depends_on,
            id,
        })
    }

    fn code(&self, node: &KdlNode, function: &str) -> ConfigResult<CodeSpec> {
        if let Some(path) = self.prop(node, "path") {
            return Ok(CodeSpec::Path(path));
        }
        let bucket = self.prop(node, "bucket").ok_or_else(|| {
            ConfigError::MissingField(format!("code path or bucket on '{function}'"))
        })?;
        let key = match self.prop(node, "key-ref") {
            Some(path) => ValueSpec::reference(&path).ok_or_else(|| {
                ConfigError::invalid("key-ref", format!("expected node.attribute, got \"{path}\""))
            })?,
            None => ValueSpec::Literal(self.required_prop(node, function, "key")?),
        };
        Ok(CodeSpec::Bucket { bucket, key })
    }

    fn policy(&self, node: &KdlNode) -> ConfigResult<PolicyStatementSpec> {
        let effect = self.prop(node, "effect").unwrap_or_else(|| "allow".into());
        if !matches!(effect.as_str(), "allow" | "deny") {
            return Err(ConfigError::invalid(
                "policy effect",
                format!("expected \"allow\" or \"deny\", got \"{effect}\""),
            ));
        }

        let mut actions = Vec::new();
        let mut resources = Vec::new();
        for child in children(node) {
            match child.name().value() {
                "actions" => actions.extend(self.args(child)),
                "resource" => resources.push(self.value(child, 0, "policy resource")?),
                _ => {}
            }
        }
        if actions.is_empty() {
            return Err(ConfigError::MissingField("policy actions".to_string()));
        }

        Ok(PolicyStatementSpec {
            effect,
            actions,
            resources,
        })
    }

    fn trigger(&self, node: &KdlNode) -> ConfigResult<TriggerSpec> {
        let id = self.id(node, "trigger")?;
        let event_name = self.required_prop(node, &id, "event")?;
        let event = TRIGGER_EVENTS
            .iter()
            .find(|(kdl_name, service_name)| *kdl_name == event_name || *service_name == event_name)
            .map(|(_, service_name)| service_name.to_string())
            .ok_or_else(|| {
                ConfigError::invalid(
                    format!("event on '{id}'"),
                    format!("unknown pool event \"{event_name}\""),
                )
            })?;

        Ok(TriggerSpec {
            pool: self.required_prop(node, &id, "pool")?,
            function: self.required_prop(node, &id, "function")?,
            event,
            depends_on: self.depends_on(node),
            id,
        })
    }

    fn bucket(&self, node: &KdlNode) -> ConfigResult<BucketSpec> {
        let id = self.id(node, "bucket")?;
        Ok(BucketSpec {
            name: self.required_prop(node, &id, "name")?,
            versioned: get_bool_prop(node, "versioned").unwrap_or(false),
            public_read: get_bool_prop(node, "public-read").unwrap_or(false),
            depends_on: self.depends_on(node),
            id,
        })
    }

    fn deployment(&self, node: &KdlNode) -> ConfigResult<DeploymentSpec> {
        let id = self.id(node, "deployment")?;
        let mut sources = Vec::new();
        let mut depends_on = self.depends_on(node);
        for child in children(node) {
            match child.name().value() {
                "source" => sources.extend(self.args(child)),
                "depends-on" => depends_on.extend(self.args(child)),
                _ => {}
            }
        }
        if sources.is_empty() {
            return Err(ConfigError::MissingField(format!("source on '{id}'")));
        }

        Ok(DeploymentSpec {
            bucket: self.required_prop(node, &id, "bucket")?,
            extract: get_bool_prop(node, "extract").unwrap_or(true),
            key_prefix: self.prop(node, "prefix"),
            output_object_keys: get_bool_prop(node, "output-object-keys").unwrap_or(true),
            sources,
            depends_on,
            id,
        })
    }
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(name, "expected a non-negative integer")),
    }
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    // Repeated properties, e.g. depends-on="a" depends-on="b"
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VariableContextBuilder;

    const SIMPLE_POOL: &str = r#"
        topology "1clickparish"

        pool "pool" name="${topology.name}-${stage}" {
            sign-in-case-sensitive #false
            standard-attribute "email" required=#true mutable=#false
            standard-attribute "fullname"
            custom-attribute "websiteId" min-len=4 max-len=30
        }

        domain "domain" pool="pool" prefix="${topology.name}-auth"

        provider "googleProvider" pool="pool" type="google" client-id="google-client-id" {
            secret "1clickparish/bullfrog"
            attribute-mapping email="email" givenName="given_name"
            scopes "profile" "email" "openid"
        }

        provider "facebookProvider" pool="pool" type="facebook" client-id="facebook-client-id" {
            secret "1clickparish/calftadpole" key="clientSecret" mode="deferred"
            scopes "public_profile" "email"
        }

        client "client" pool="pool" hosted-ui=#true {
            auth-flows "user-password"
            supported-providers "google" "facebook" "cognito"
            auth-session-validity "15m"
            access-token-validity "60m"
            id-token-validity "1h"
            refresh-token-validity "30d"
        }
    "#;

    fn vars() -> VariableContext {
        VariableContextBuilder::new().with_stage("dev").build()
    }

    #[test]
    fn test_parse_simple_pool_topology() {
        let spec = parse_topology(SIMPLE_POOL, vars()).unwrap();

        assert_eq!(spec.name, "1clickparish");
        assert_eq!(spec.pools.len(), 1);
        assert_eq!(spec.pools[0].name.as_deref(), Some("1clickparish-dev"));
        assert!(!spec.pools[0].sign_in_case_sensitive);
        assert_eq!(spec.pools[0].standard_attributes.len(), 2);
        assert!(spec.pools[0].standard_attributes[0].required);
        assert!(!spec.pools[0].standard_attributes[0].mutable);
        assert!(spec.pools[0].standard_attributes[1].mutable);
        assert_eq!(spec.pools[0].custom_attributes[0].max_len, Some(30));

        assert_eq!(spec.domains[0].prefix, "1clickparish-auth");

        let google = &spec.providers[0];
        assert_eq!(google.provider_type, ProviderType::Google);
        assert_eq!(google.effective_name(), "Google");
        assert_eq!(google.secret.mode, ResolutionMode::Eager);
        assert_eq!(google.attribute_mapping["givenName"], "given_name");
        assert_eq!(google.scopes, vec!["profile", "email", "openid"]);

        let facebook = &spec.providers[1].secret;
        assert_eq!(facebook.mode, ResolutionMode::Deferred);
        assert_eq!(facebook.key.as_deref(), Some("clientSecret"));

        let client = &spec.clients[0];
        assert!(client.hosted_ui);
        assert_eq!(client.supported_providers, vec!["google", "facebook", "cognito"]);
        assert_eq!(client.auth_session_validity, Some(Duration::from_secs(900)));
        assert_eq!(client.id_token_validity, Some(Duration::from_secs(3600)));
        assert_eq!(
            client.refresh_token_validity,
            Some(Duration::from_secs(30 * 86_400))
        );
    }

    #[test]
    fn test_parse_function_and_deployments() {
        let kdl = r#"
            topology "ssg"

            bucket "lambdaBucket" name="lambda-s3-bucket-${account}"

            deployment "deployLambda" bucket="lambdaBucket" extract=#false {
                source "../lambda/ssg/ssg.py.gz"
            }

            function "lambda" runtime="python3.10" handler="ssg.main" timeout=30 {
                code bucket="lambdaBucket" key-ref="deployLambda.objectKeys.0"
                env "STAGE" "${stage}"
                env "COGNITO_CLIENT_ID" ref="client2.clientId"
                policy effect="allow" {
                    actions "s3:PutObject" "s3:DeleteObject" "s3:ListBucket"
                    resource ref="lambdaBucket.arn"
                }
                depends-on "deployLambda"
            }
        "#;
        let vars = VariableContextBuilder::new()
            .with_stage("prod")
            .with_account("123456789012")
            .build();

        let spec = parse_topology(kdl, vars).unwrap();

        assert_eq!(spec.buckets[0].name, "lambda-s3-bucket-123456789012");
        assert!(!spec.deployments[0].extract);
        assert!(spec.deployments[0].output_object_keys);

        let function = &spec.functions[0];
        assert_eq!(function.timeout_seconds, Some(30));
        assert_eq!(function.depends_on, vec!["deployLambda"]);
        assert_eq!(
            function.code,
            CodeSpec::Bucket {
                bucket: "lambdaBucket".into(),
                key: ValueSpec::reference("deployLambda.objectKeys.0").unwrap(),
            }
        );
        assert_eq!(function.environment["STAGE"], ValueSpec::Literal("prod".into()));
        assert_eq!(
            function.environment["COGNITO_CLIENT_ID"],
            ValueSpec::Reference {
                node: "client2".into(),
                attribute: "clientId".into(),
            }
        );
        assert_eq!(function.policies[0].actions.len(), 3);
    }

    #[test]
    fn test_parse_trigger_event_names() {
        let kdl = r#"
            topology "t"
            trigger "a" pool="pool2" event="pre-sign-up" function="preSignUp"
            trigger "b" pool="pool2" event="postConfirmation" function="welcome"
        "#;
        let spec = parse_topology(kdl, vars()).unwrap();
        assert_eq!(spec.triggers[0].event, "preSignUp");
        assert_eq!(spec.triggers[1].event, "postConfirmation");

        let bad = r#"
            topology "t"
            trigger "a" pool="p" event="on-login" function="f"
        "#;
        assert!(matches!(
            parse_topology(bad, vars()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_depends_on_property_and_child() {
        let kdl = r#"
            topology "t"
            bucket "b" name="x" depends-on="a" depends-on="c"
            pool "p" {
                depends-on "b" "c"
            }
        "#;
        let spec = parse_topology(kdl, vars()).unwrap();
        assert_eq!(spec.buckets[0].depends_on, vec!["a", "c"]);
        assert_eq!(spec.pools[0].depends_on, vec!["b", "c"]);
    }

    #[test]
    fn test_missing_topology_name() {
        let result = parse_topology(r#"pool "p""#, vars());
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_missing_required_fields() {
        let no_pool = r#"
            topology "t"
            domain "d" prefix="auth"
        "#;
        assert!(matches!(
            parse_topology(no_pool, vars()),
            Err(ConfigError::MissingField(_))
        ));

        let no_code = r#"
            topology "t"
            function "f" runtime="nodejs20.x" handler="index.handler"
        "#;
        assert!(matches!(
            parse_topology(no_code, vars()),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let kdl = r#"
            topology "t"
            client "c" pool="p" {
                access-token-validity "sixty minutes"
            }
        "#;
        assert!(matches!(
            parse_topology(kdl, vars()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("30d"), Some(Duration::from_secs(2_592_000)));
        assert_eq!(parse_duration("15"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("5w"), None);
        assert_eq!(parse_duration("45s"), None);
    }

    #[test]
    fn test_sub_minute_validity_rejected() {
        for value in ["30s", "90s"] {
            let kdl = format!(
                r#"
                topology "t"
                client "c" pool="p" {{
                    auth-session-validity "{value}"
                }}
                "#
            );
            assert!(
                matches!(
                    parse_topology(&kdl, vars()),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn test_provider_requires_exactly_one_secret() {
        let missing = r#"
            topology "t"
            pool "pool"
            provider "google" pool="pool" type="google" client-id="id"
        "#;
        match parse_topology(missing, vars()) {
            Err(ConfigError::MissingField(field)) => assert!(field.contains("google")),
            other => panic!("expected a missing secret, got {other:?}"),
        }

        let repeated = r#"
            topology "t"
            pool "pool"
            provider "google" pool="pool" type="google" client-id="id" {
                secret "app/google"
                secret "app/other"
            }
        "#;
        assert!(matches!(
            parse_topology(repeated, vars()),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_declaration_order_follows_the_file() {
        let kdl = r#"
            topology "t"
            bucket "assets" name="assets"
            settings {
                workers 2
            }
            pool "pool"
            unknown "ignored"
            domain "domain" pool="pool" prefix="auth"
        "#;
        let spec = parse_topology(kdl, vars()).unwrap();
        assert_eq!(spec.declaration_order, vec!["assets", "pool", "domain"]);
    }

    #[test]
    fn test_load_topology_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.kdl");
        std::fs::write(&path, SIMPLE_POOL).unwrap();

        let spec = load_topology(&path, vars()).unwrap();
        assert_eq!(spec.providers.len(), 2);

        let missing = load_topology(dir.path().join("nope.kdl"), vars());
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
