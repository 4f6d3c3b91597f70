//! Apply command: create or update every resource of a topology.

use anyhow::{Context, Result};
use keystack_config::ExecutorSettings;
use keystack_core::{ApplyResult, ExitStatus, SecretResolver};
use keystack_provider::{EnvSecretResolver, FileSecretResolver};
use keystack_scheduler::{ProvisioningExecutor, ProvisioningPlan};
use std::path::Path;
use std::sync::Arc;
use tracing::error;

use super::{cancel_on_ctrl_c, execute_options, load, open_provider, print_event};
use crate::{ExecArgs, StateArgs, TargetArgs};

/// Settings set on the command line; they win over the topology file.
fn overrides(exec: &ExecArgs) -> ExecutorSettings {
    ExecutorSettings {
        failure_policy: exec.on_failure.map(|policy| policy.as_str().to_string()),
        max_attempts: exec.max_attempts,
        workers: exec.workers,
        ..Default::default()
    }
}

pub async fn run(
    file: &Path,
    target: &TargetArgs,
    state: &StateArgs,
    exec: &ExecArgs,
) -> Result<ExitStatus> {
    let loaded = load(file, target)?;
    let settings = loaded.spec.settings.clone().merge(overrides(exec));
    let options = execute_options(&settings, cancel_on_ctrl_c())?;

    let provider = Arc::new(open_provider(state, target).await?);
    let resolver: Arc<dyn SecretResolver> = match &exec.secrets {
        Some(path) => Arc::new(
            FileSecretResolver::open(path)
                .await
                .with_context(|| format!("Failed to load secrets file: {}", path.display()))?,
        ),
        None => Arc::new(EnvSecretResolver::from_env()),
    };

    if !state.json {
        println!(
            "Applying '{}': {} resources ({:?}, {:?})\n",
            loaded.spec.name,
            loaded.plan.len(),
            options.policy,
            options.mode
        );
    }

    let plan = Arc::new(loaded.plan);
    let executor = Arc::new(ProvisioningExecutor::new(provider, resolver, options));
    let (mut rx, handle) = executor.execute(plan.clone());

    while let Some(event) = rx.recv().await {
        if !state.json {
            print_event(&event);
        }
    }

    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Provisioning task failed");
            return Ok(ExitStatus::LeftInPlace);
        }
    };

    if state.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&plan, &result);
    }
    Ok(result.exit_status())
}

fn print_summary(plan: &ProvisioningPlan, result: &ApplyResult) {
    println!("\n--- Resource Summary ---");
    for id in plan.forward() {
        let state = result
            .state_of(id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("  {id} - {state}");
    }

    println!(
        "\ncreated {}, updated {}, unchanged {}",
        result.created_ids.len(),
        result.updated_ids.len(),
        result.unchanged_ids.len()
    );

    if let Some(failure) = &result.error {
        let node = failure
            .node
            .as_ref()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("✗ {node} ({}): {}", failure.kind, failure.message);
    }
    if result.rollback_performed {
        println!("↺ rolled back {} resources", result.rolled_back_ids.len());
        for failure in &result.rollback_errors {
            println!("  ! rollback error ({}): {}", failure.kind, failure.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OnFailure;
    use keystack_scheduler::FailurePolicy;
    use tokio_util::sync::CancellationToken;

    fn policy(topology: Option<&str>, exec: &ExecArgs) -> FailurePolicy {
        let from_file = ExecutorSettings {
            failure_policy: topology.map(str::to_string),
            ..Default::default()
        };
        let settings = from_file.merge(overrides(exec));
        execute_options(&settings, CancellationToken::new())
            .unwrap()
            .policy
    }

    #[test]
    fn test_on_failure_flag_overrides_topology_policy() {
        let halt = ExecArgs {
            on_failure: Some(OnFailure::Halt),
            ..Default::default()
        };
        assert_eq!(policy(Some("rollback"), &halt), FailurePolicy::Halt);

        let rollback = ExecArgs {
            on_failure: Some(OnFailure::Rollback),
            ..Default::default()
        };
        assert_eq!(policy(Some("halt"), &rollback), FailurePolicy::Rollback);
        assert_eq!(policy(None, &rollback), FailurePolicy::Rollback);
    }

    #[test]
    fn test_topology_policy_kept_without_flag() {
        let exec = ExecArgs::default();
        assert_eq!(policy(Some("rollback"), &exec), FailurePolicy::Rollback);
        assert_eq!(policy(None, &exec), FailurePolicy::Halt);
    }
}
