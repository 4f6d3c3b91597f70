//! CLI command implementations.

pub mod apply;
pub mod destroy;
pub mod plan;
pub mod status;
pub mod validate;

use anyhow::{Context, Result};
use keystack_config::{
    ExecutorSettings, TopologySpec, VariableContext, VariableContextBuilder, compose,
    load_topology,
};
use keystack_core::ExitStatus;
use keystack_provider::LocalProvider;
use keystack_scheduler::{
    ExecuteOptions, ExecutionMode, FailurePolicy, ProvisionEvent, ProvisioningPlan, RetryConfig,
    graph, schedule,
};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{StateArgs, TargetArgs};

/// Exit status for failures before any resource was touched.
pub const SETUP_FAILURE: ExitStatus = ExitStatus::PlanningError;

/// A parsed topology and its plan.
pub struct Loaded {
    pub spec: TopologySpec,
    pub plan: ProvisioningPlan,
}

pub fn variables(target: &TargetArgs) -> Result<VariableContext> {
    let mut builder = VariableContextBuilder::new();
    if let Some(stage) = &target.stage {
        builder = builder.with_stage(stage);
    }
    if let Some(account) = &target.account {
        builder = builder.with_account(account);
    }
    if let Some(region) = &target.region {
        builder = builder.with_region(region);
    }

    let mut vars = builder.build();
    vars.populate_env();
    for pair in &target.vars {
        vars.set_pair(pair)
            .with_context(|| format!("Invalid --var '{pair}', expected KEY=VALUE"))?;
    }
    Ok(vars)
}

/// Parse, compose, build and schedule a topology file.
pub fn load(file: &Path, target: &TargetArgs) -> Result<Loaded> {
    let vars = variables(target)?;
    let spec = load_topology(file, vars)
        .with_context(|| format!("Failed to load topology: {}", file.display()))?;
    let nodes = compose(&spec).with_context(|| format!("Invalid topology '{}'", spec.name))?;
    let graph = graph::build(nodes).context("Failed to build dependency graph")?;
    let plan = schedule(graph).context("Failed to schedule topology")?;

    info!(topology = %spec.name, nodes = plan.len(), "Planned topology");
    Ok(Loaded { spec, plan })
}

pub async fn open_provider(state: &StateArgs, target: &TargetArgs) -> Result<LocalProvider> {
    let mut provider = LocalProvider::open(&state.state)
        .await
        .with_context(|| format!("Failed to open state file: {}", state.state.display()))?;
    if let Some(account) = &target.account {
        provider = provider.with_account(account);
    }
    if let Some(region) = &target.region {
        provider = provider.with_region(region);
    }
    Ok(provider)
}

/// Turn merged settings into executor options.
pub fn execute_options(
    settings: &ExecutorSettings,
    cancel: CancellationToken,
) -> Result<ExecuteOptions> {
    let policy = match &settings.failure_policy {
        Some(policy) => policy.parse::<FailurePolicy>().map_err(anyhow::Error::msg)?,
        None => FailurePolicy::default(),
    };

    let mode = match settings.workers {
        Some(workers) if workers > 1 => ExecutionMode::Parallel { workers },
        _ => ExecutionMode::Sequential,
    };

    let mut retry = RetryConfig::default();
    if let Some(attempts) = settings.max_attempts {
        retry.max_attempts = attempts.max(1);
    }
    if let Some(ms) = settings.base_delay_ms {
        retry.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = settings.max_delay_ms {
        retry.max_delay = Duration::from_millis(ms);
    }

    Ok(ExecuteOptions {
        policy,
        mode,
        retry,
        cancel,
    })
}

/// A token cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for in-flight resources to finish");
            child.cancel();
        }
    });
    token
}

pub fn print_event(event: &ProvisionEvent) {
    match event {
        ProvisionEvent::NodeStarted { node, kind } => println!("▶ {node} ({kind})"),
        ProvisionEvent::NodeRetrying {
            node,
            attempt,
            error,
        } => println!("  ↻ {node} attempt {attempt} failed: {error}"),
        ProvisionEvent::NodeCompleted { node, change } => println!("✓ {node} {change}"),
        ProvisionEvent::NodeFailed { node, error } => {
            println!("✗ {node} failed ({}): {}", error.kind, error.message)
        }
        ProvisionEvent::NodeRolledBack { node } => println!("↺ {node} rolled back"),
        ProvisionEvent::NodeDeleted { node, existed } => {
            if *existed {
                println!("✓ {node} deleted");
            } else {
                println!("⊘ {node} already absent");
            }
        }
        ProvisionEvent::RunCompleted { success } => {
            if *success {
                println!("\n--- Run completed successfully ---");
            } else {
                println!("\n--- Run failed ---");
            }
        }
    }
}
