//! Topological scheduler.
//!
//! Orders nodes for creation (dependencies first) using Kahn's algorithm.
//! Among nodes whose dependencies are all satisfied, the one declared first
//! is taken, so identical input always yields an identical plan.

use keystack_core::{Error, NodeId, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::graph::Graph;

/// An executable ordering of a graph.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningPlan {
    #[serde(skip)]
    graph: Arc<Graph>,
    /// Creation order.
    forward: Vec<NodeId>,
    /// Deletion order, the exact reverse of `forward`.
    reverse: Vec<NodeId>,
    /// Maximal sets of nodes with no ordering constraint between them.
    layers: Vec<Vec<NodeId>>,
}

impl ProvisioningPlan {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn forward(&self) -> &[NodeId] {
        &self.forward
    }

    pub fn reverse(&self) -> &[NodeId] {
        &self.reverse
    }

    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Position of a node in the creation order.
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.forward.iter().position(|n| n == id)
    }
}

/// Compute the creation and deletion order of a graph.
///
/// Consumes the graph; the plan keeps it immutable behind an `Arc`.
pub fn schedule(graph: Graph) -> Result<ProvisioningPlan> {
    let n = graph.len();
    let mut remaining: Vec<usize> = (0..n).map(|i| graph.dependency_indices(i).len()).collect();
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in graph.dependent_indices(next) {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < n {
        let cycle = graph.find_cycle().unwrap_or_else(|| {
            (0..n)
                .filter(|&i| remaining[i] > 0)
                .map(|i| graph.nodes()[i].id.clone())
                .collect()
        });
        return Err(Error::Cycle(cycle));
    }

    // Layer = longest dependency chain below the node.
    let mut depth = vec![0usize; n];
    for &i in &order {
        depth[i] = graph
            .dependency_indices(i)
            .iter()
            .map(|&d| depth[d] + 1)
            .max()
            .unwrap_or(0);
    }
    let layer_count = depth.iter().copied().max().map_or(0, |d| d + 1);
    let mut layers = vec![Vec::new(); layer_count];
    for &i in &order {
        layers[depth[i]].push(graph.nodes()[i].id.clone());
    }

    let forward: Vec<NodeId> = order.iter().map(|&i| graph.nodes()[i].id.clone()).collect();
    let reverse: Vec<NodeId> = forward.iter().rev().cloned().collect();

    debug!(nodes = n, layers = layers.len(), "Scheduled provisioning plan");

    Ok(ProvisioningPlan {
        graph: Arc::new(graph),
        forward,
        reverse,
        layers,
    })
}

/// Check that every node appears after all of its dependencies.
pub fn respects_dependencies(graph: &Graph, order: &[NodeId]) -> bool {
    let mut seen = BTreeSet::new();
    for id in order {
        let Some(i) = graph.declaration_index(id) else {
            return false;
        };
        if !graph.dependency_indices(i).iter().all(|d| seen.contains(d)) {
            return false;
        }
        seen.insert(i);
    }
    seen.len() == graph.len()
}
