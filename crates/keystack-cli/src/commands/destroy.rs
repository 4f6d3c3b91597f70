//! Destroy command: delete every resource of a topology.

use anyhow::Result;
use keystack_config::ExecutorSettings;
use keystack_core::ExitStatus;
use keystack_provider::EnvSecretResolver;
use keystack_scheduler::ProvisioningExecutor;
use std::path::Path;
use std::sync::Arc;
use tracing::error;

use super::{cancel_on_ctrl_c, execute_options, load, open_provider, print_event};
use crate::{StateArgs, TargetArgs};

pub async fn run(
    file: &Path,
    target: &TargetArgs,
    state: &StateArgs,
    max_attempts: Option<u32>,
) -> Result<ExitStatus> {
    let loaded = load(file, target)?;
    let settings = loaded.spec.settings.clone().merge(ExecutorSettings {
        max_attempts,
        ..Default::default()
    });
    let options = execute_options(&settings, cancel_on_ctrl_c())?;

    let provider = Arc::new(open_provider(state, target).await?);
    // Deletion never reads secret values.
    let resolver = Arc::new(EnvSecretResolver::from_map(Default::default()));

    if !state.json {
        println!(
            "Destroying '{}': {} resources\n",
            loaded.spec.name,
            loaded.plan.len()
        );
    }

    let executor = Arc::new(ProvisioningExecutor::new(provider, resolver, options));
    let (mut rx, handle) = executor.execute_destroy(Arc::new(loaded.plan));

    while let Some(event) = rx.recv().await {
        if !state.json {
            print_event(&event);
        }
    }

    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Teardown task failed");
            return Ok(ExitStatus::LeftInPlace);
        }
    };

    if state.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\ndeleted {} resources", result.deleted_ids.len());
        if let Some(failure) = &result.error {
            let node = failure
                .node
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("✗ {node} ({}): {}", failure.kind, failure.message);
        }
    }
    Ok(result.exit_status())
}
