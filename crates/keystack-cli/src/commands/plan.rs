//! Plan display command.

use anyhow::Result;
use keystack_core::{ExitStatus, NodeId};
use keystack_scheduler::EdgeOrigin;
use std::collections::HashMap;
use std::path::Path;

use super::load;
use crate::TargetArgs;

pub fn run(file: &Path, target: &TargetArgs, json: bool) -> Result<ExitStatus> {
    let loaded = load(file, target)?;
    let plan = &loaded.plan;
    let graph = plan.graph();

    if json {
        let doc = serde_json::json!({
            "topology": loaded.spec.name,
            "plan": plan,
            "edges": graph.edges(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(ExitStatus::Success);
    }

    let layer_of: HashMap<&NodeId, usize> = plan
        .layers()
        .iter()
        .enumerate()
        .flat_map(|(depth, layer)| layer.iter().map(move |id| (id, depth)))
        .collect();

    println!(
        "Plan for '{}': {} resources in {} layers\n",
        loaded.spec.name,
        plan.len(),
        plan.layers().len()
    );

    for (position, id) in plan.forward().iter().enumerate() {
        let kind = graph
            .node(id)
            .map(|node| node.kind.to_string())
            .unwrap_or_default();
        let layer = layer_of.get(id).copied().unwrap_or_default();
        println!("{:>3}. {id} ({kind}) [layer {layer}]", position + 1);

        for edge in graph.edges().iter().filter(|e| &e.from == id) {
            match &edge.origin {
                EdgeOrigin::Reference {
                    property,
                    attribute,
                } => println!("       after {} ({property} ← {}.{attribute})", edge.to, edge.to),
                EdgeOrigin::Explicit => println!("       after {} (explicit)", edge.to),
            }
        }
    }

    Ok(ExitStatus::Success)
}
