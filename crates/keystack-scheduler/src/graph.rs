//! Dependency graph builder.
//!
//! Edges come from two channels that unify in one graph:
//! - property values referencing another node's output attribute
//! - explicit dependencies declared on the node, for ordering constraints
//!   that exist at the control-plane level without any data reference
//!
//! An edge `(from, to)` means `to` must exist before `from` is created.

use keystack_core::{Error, NodeId, ResourceNode, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Where an edge came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeOrigin {
    /// A property (at `property`, a dotted path) referencing `attribute`.
    Reference { property: String, attribute: String },
    /// A declared extra dependency.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub origin: EdgeOrigin,
}

/// Nodes plus derived edges. Immutable once built.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<ResourceNode>,
    index: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
    /// For each node (by declaration index), the nodes it depends on.
    dependencies: Vec<BTreeSet<usize>>,
    /// For each node, the nodes that depend on it.
    dependents: Vec<BTreeSet<usize>>,
}

impl Graph {
    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of a node, in declaration order.
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<&NodeId> {
        self.index
            .get(id)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| &self.nodes[d].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of a node, in declaration order.
    pub fn dependents_of(&self, id: &NodeId) -> Vec<&NodeId> {
        self.index
            .get(id)
            .map(|&i| self.dependents[i].iter().map(|&d| &self.nodes[d].id).collect())
            .unwrap_or_default()
    }

    pub(crate) fn declaration_index(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn dependency_indices(&self, i: usize) -> &BTreeSet<usize> {
        &self.dependencies[i]
    }

    pub(crate) fn dependent_indices(&self, i: usize) -> &BTreeSet<usize> {
        &self.dependents[i]
    }

    /// Find a dependency cycle, returned as a closed path (`a -> b -> a`).
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &Graph,
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<NodeId>> {
            marks[node] = Mark::OnStack;
            stack.push(node);

            for &dep in &graph.dependencies[node] {
                match marks[dep] {
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut path: Vec<NodeId> = stack[start..]
                            .iter()
                            .map(|&n| graph.nodes[n].id.clone())
                            .collect();
                        path.push(graph.nodes[dep].id.clone());
                        return Some(path);
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();
        for node in 0..self.nodes.len() {
            if marks[node] == Mark::Unvisited {
                if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

/// Collects nodes and assembles them into a [`Graph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<ResourceNode>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, node: ResourceNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn extend(mut self, nodes: impl IntoIterator<Item = ResourceNode>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Validate the nodes and derive edges.
    ///
    /// Fails with `DuplicateId`, `Schema`, `UnknownReference` or `Cycle`.
    pub fn build(self) -> Result<Graph> {
        let nodes = self.nodes;

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(Error::DuplicateId(node.id.clone()));
            }
        }

        for node in &nodes {
            node.validate_schema()?;
        }

        let mut edges = Vec::new();
        let mut dependencies = vec![BTreeSet::new(); nodes.len()];
        let mut dependents = vec![BTreeSet::new(); nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            let referenced = node.references().into_iter().map(|(property, reference)| {
                (
                    &reference.node,
                    EdgeOrigin::Reference {
                        property,
                        attribute: reference.attribute.clone(),
                    },
                )
            });
            let explicit = node
                .explicit_dependencies
                .iter()
                .map(|dep| (dep, EdgeOrigin::Explicit));

            for (target, origin) in referenced.chain(explicit) {
                let Some(&j) = index.get(target) else {
                    return Err(Error::UnknownReference {
                        from: node.id.clone(),
                        target: target.clone(),
                    });
                };
                dependencies[i].insert(j);
                dependents[j].insert(i);
                edges.push(Edge {
                    from: node.id.clone(),
                    to: target.clone(),
                    origin,
                });
            }
        }

        let graph = Graph {
            nodes,
            index,
            edges,
            dependencies,
            dependents,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::Cycle(cycle));
        }

        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Built dependency graph"
        );
        Ok(graph)
    }
}

/// Build a graph from a list of nodes.
pub fn build(nodes: Vec<ResourceNode>) -> Result<Graph> {
    GraphBuilder::new().extend(nodes).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystack_core::{PropertyValue, ResourceKind};

    fn pool(id: &str) -> ResourceNode {
        ResourceNode::new(id, ResourceKind::Pool)
    }

    fn domain(id: &str, pool: &str) -> ResourceNode {
        ResourceNode::new(id, ResourceKind::Domain)
            .with_property("userPoolId", PropertyValue::reference(pool, "poolId"))
            .with_property("domainPrefix", PropertyValue::literal("auth"))
    }

    fn client(id: &str, pool: &str) -> ResourceNode {
        ResourceNode::new(id, ResourceKind::Client)
            .with_property("userPoolId", PropertyValue::reference(pool, "poolId"))
    }

    #[test]
    fn test_reference_and_explicit_edges() {
        let graph = build(vec![
            pool("pool"),
            domain("domain", "pool"),
            client("client", "pool").depends_on("domain"),
        ])
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edges().len(), 3);
        assert_eq!(
            graph.dependencies_of(&NodeId::new("client")),
            vec![&NodeId::new("pool"), &NodeId::new("domain")]
        );
        assert_eq!(
            graph.dependents_of(&NodeId::new("pool")),
            vec![&NodeId::new("domain"), &NodeId::new("client")]
        );

        let explicit: Vec<_> = graph
            .edges()
            .iter()
            .filter(|e| e.origin == EdgeOrigin::Explicit)
            .collect();
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].from, NodeId::new("client"));
        assert_eq!(explicit[0].to, NodeId::new("domain"));
    }

    #[test]
    fn test_reference_edge_records_property_path() {
        let graph = build(vec![pool("pool"), domain("domain", "pool")]).unwrap();
        assert_eq!(
            graph.edges()[0].origin,
            EdgeOrigin::Reference {
                property: "userPoolId".to_string(),
                attribute: "poolId".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = build(vec![pool("pool"), pool("pool")]).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id.as_str() == "pool"));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let err = build(vec![domain("domain", "missing")]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownReference { from, target }
                if from.as_str() == "domain" && target.as_str() == "missing"
        ));
    }

    #[test]
    fn test_unknown_explicit_dependency_rejected() {
        let err = build(vec![pool("pool").depends_on("ghost")]).unwrap_err();
        assert!(matches!(err, Error::UnknownReference { .. }));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let err = build(vec![
            pool("a").depends_on("c"),
            pool("b").depends_on("a"),
            pool("c").depends_on("b"),
        ])
        .unwrap_err();

        match err {
            Error::Cycle(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = build(vec![pool("a").depends_on("a")]).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn test_schema_violation_rejected() {
        let bad = ResourceNode::new("domain", ResourceKind::Domain)
            .with_property("userPoolId", PropertyValue::literal("p"));
        let err = build(vec![bad]).unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }
}
