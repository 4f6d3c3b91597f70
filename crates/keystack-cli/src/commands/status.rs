//! Resource status command.

use anyhow::{Context, Result};
use keystack_core::{ExitStatus, NodeId, OutputAttributes, ResourceKind, ResourceProvider};
use serde::Serialize;
use std::path::Path;

use super::{load, open_provider};
use crate::{StateArgs, TargetArgs};

#[derive(Serialize)]
struct StatusEntry {
    id: NodeId,
    kind: ResourceKind,
    present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outputs: Option<OutputAttributes>,
}

pub async fn run(file: &Path, target: &TargetArgs, state: &StateArgs) -> Result<ExitStatus> {
    let loaded = load(file, target)?;
    let provider = open_provider(state, target).await?;

    let mut entries = Vec::new();
    for id in loaded.plan.forward() {
        let node = loaded
            .plan
            .graph()
            .node(id)
            .with_context(|| format!("Plan references unknown node '{id}'"))?;
        let outputs = provider
            .describe(node.kind, id)
            .await
            .with_context(|| format!("Failed to describe '{id}'"))?;
        entries.push(StatusEntry {
            id: id.clone(),
            kind: node.kind,
            present: outputs.is_some(),
            outputs,
        });
    }

    if state.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(ExitStatus::Success);
    }

    let present = entries.iter().filter(|e| e.present).count();
    println!(
        "Topology '{}': {present}/{} resources present\n",
        loaded.spec.name,
        entries.len()
    );
    for entry in &entries {
        let marker = if entry.present { "●" } else { "○" };
        println!("{marker} {} ({})", entry.id, entry.kind);
        if let Some(outputs) = &entry.outputs {
            for key in outputs.keys() {
                if let Some(value) = outputs.get(key) {
                    println!("    {key} = {value}");
                }
            }
        }
    }

    Ok(ExitStatus::Success)
}
