//! `${...}` interpolation in topology strings.
//!
//! - `${topology.name}`: name from the `topology` node
//! - `${stage}`, `${account}`, `${region}`: deployment target
//! - `${env.NAME}`: process environment
//! - `${timestamp}` (unix seconds) and `${date}` (YYYY-MM-DD)
//! - `${name}`: custom value from `--var name=value`
//!
//! One parametrized file covers every stage of a topology. Unknown
//! variables are kept verbatim.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variables available while reading a topology.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub topology_name: String,
    pub stage: Option<String>,
    pub account: Option<String>,
    pub region: Option<String>,
    pub env: HashMap<String, String>,
    /// Values from `--var`; these shadow stage, account and region.
    pub custom: HashMap<String, String>,
}

// `${name}` or `${scope.name}`
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the process environment for `${env.*}`.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Parse and add a `name=value` pair.
    pub fn set_pair(&mut self, pair: &str) -> Option<()> {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.set(name, value);
        Some(())
    }

    /// Value of one variable, without the `${}` wrapper.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let path: Vec<&str> = var_name.split('.').collect();
        let now = chrono::Utc::now;

        match path.as_slice() {
            ["topology", "name"] => Some(self.topology_name.clone()),

            ["env", key] => self.env.get(*key).cloned(),

            ["timestamp"] => Some(now().timestamp().to_string()),
            ["date"] => Some(now().date_naive().to_string()),

            // Custom variables shadow the built-in target variables
            [name] => self.custom.get(*name).cloned().or_else(|| match *name {
                "stage" => self.stage.clone(),
                "account" => self.account.clone(),
                "region" => self.region.clone(),
                _ => None,
            }),

            _ => None,
        }
    }

    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                self.resolve(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|input| self.interpolate(input)).collect()
    }
}

#[derive(Debug, Default)]
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topology(mut self, name: impl Into<String>) -> Self {
        self.ctx.topology_name = name.into();
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.ctx.stage = Some(stage.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.ctx.account = Some(account.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.ctx.region = Some(region.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}
