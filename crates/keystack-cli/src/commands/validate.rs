//! Topology validation command.

use anyhow::Result;
use keystack_core::ExitStatus;
use std::path::Path;

use super::load;
use crate::TargetArgs;

pub fn run(file: &Path, target: &TargetArgs) -> Result<ExitStatus> {
    let loaded = load(file, target)?;
    let graph = loaded.plan.graph();

    println!(
        "✓ Topology '{}' is valid: {} resources, {} edges, {} layers",
        loaded.spec.name,
        graph.len(),
        graph.edges().len(),
        loaded.plan.layers().len()
    );
    Ok(ExitStatus::Success)
}
