//! Executor settings declared in a topology's `settings` block.

use crate::{ConfigError, ConfigResult};
use kdl::KdlNode;
use serde::{Deserialize, Serialize};

/// Execution settings. Unset fields fall back to the executor defaults,
/// and command-line flags take precedence over anything set here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// `halt` or `rollback`.
    pub failure_policy: Option<String>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    /// Worker count for layer-parallel execution; absent means sequential.
    pub workers: Option<usize>,
}

impl ExecutorSettings {
    /// Overlay `other` on top of `self`, keeping values `other` leaves unset.
    pub fn merge(self, other: ExecutorSettings) -> ExecutorSettings {
        ExecutorSettings {
            failure_policy: other.failure_policy.or(self.failure_policy),
            max_attempts: other.max_attempts.or(self.max_attempts),
            base_delay_ms: other.base_delay_ms.or(self.base_delay_ms),
            max_delay_ms: other.max_delay_ms.or(self.max_delay_ms),
            workers: other.workers.or(self.workers),
        }
    }
}

/// Parse the children of a `settings` node.
pub fn parse_settings(node: &KdlNode) -> ConfigResult<ExecutorSettings> {
    let mut settings = ExecutorSettings::default();

    let Some(children) = node.children() else {
        return Ok(settings);
    };

    for child in children.nodes() {
        let name = child.name().value();
        match name {
            "failure-policy" => {
                let policy = first_arg(child)
                    .and_then(|v| v.as_string())
                    .ok_or_else(|| ConfigError::MissingField("settings failure-policy".into()))?;
                if !matches!(policy, "halt" | "rollback") {
                    return Err(ConfigError::invalid(
                        "failure-policy",
                        format!("expected \"halt\" or \"rollback\", got \"{policy}\""),
                    ));
                }
                settings.failure_policy = Some(policy.to_string());
            }
            "max-attempts" => {
                let attempts: u32 = integer_arg(child)?;
                if attempts == 0 {
                    return Err(ConfigError::invalid("max-attempts", "must be at least 1"));
                }
                settings.max_attempts = Some(attempts);
            }
            "base-delay-ms" => settings.base_delay_ms = Some(integer_arg(child)?),
            "max-delay-ms" => settings.max_delay_ms = Some(integer_arg(child)?),
            "workers" => {
                let workers: usize = integer_arg(child)?;
                if workers == 0 {
                    return Err(ConfigError::invalid("workers", "must be at least 1"));
                }
                settings.workers = Some(workers);
            }
            other => {
                return Err(ConfigError::invalid(
                    "settings",
                    format!("unknown setting \"{other}\""),
                ));
            }
        }
    }

    Ok(settings)
}

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn integer_arg<T: TryFrom<i128>>(node: &KdlNode) -> ConfigResult<T> {
    let field = node.name().value();
    let value = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::invalid(field, "expected an integer"))?;
    T::try_from(value).map_err(|_| ConfigError::invalid(field, format!("{value} is out of range")))
}
