//! Provisioning executor - applies a plan in dependency order.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use keystack_core::{
    ApplyResult, ChangeKind, DestroyResult, Error, ErrorKind, FailureReport, NodeId, NodeState,
    OutputAttributes, PropertyValue, ResolvedProperties, ResolvedValue, ResourceKind,
    ResourceNode, ResourceProvider, Result, RunId, SecretReference, SecretResolver,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::plan::ProvisioningPlan;
use crate::retry::{RetryConfig, with_retry};
use crate::secrets::SecretIndirection;

/// What to do with already-created resources after a fatal failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop and leave created resources in place for inspection.
    #[default]
    Halt,
    /// Delete, in reverse order, the resources this run created.
    Rollback,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "halt" => Ok(FailurePolicy::Halt),
            "rollback" => Ok(FailurePolicy::Rollback),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One node at a time, in plan order.
    #[default]
    Sequential,
    /// Nodes of one layer run concurrently, bounded by `workers`.
    /// A layer starts only after the previous one finished.
    Parallel { workers: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub policy: FailurePolicy,
    pub mode: ExecutionMode,
    pub retry: RetryConfig,
    /// Halts scheduling of new nodes; in-flight provider calls complete.
    pub cancel: CancellationToken,
}

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum ProvisionEvent {
    NodeStarted { node: NodeId, kind: ResourceKind },
    NodeRetrying { node: NodeId, attempt: u32, error: String },
    NodeCompleted { node: NodeId, change: ChangeKind },
    NodeFailed { node: NodeId, error: FailureReport },
    NodeRolledBack { node: NodeId },
    NodeDeleted { node: NodeId, existed: bool },
    RunCompleted { success: bool },
}

/// A node of a parallel layer and its result, `None` when it was skipped.
type LayerOutcome<'a> = (&'a NodeId, Option<Result<ChangeKind>>);

#[derive(Clone, Default)]
struct EventSink(Option<mpsc::UnboundedSender<ProvisionEvent>>);

impl EventSink {
    fn emit(&self, event: ProvisionEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug)]
struct NodeRecord {
    state: NodeState,
    outputs: Option<OutputAttributes>,
}

/// Per-node state, each entry behind its own lock.
struct StateTable {
    records: HashMap<NodeId, Mutex<NodeRecord>>,
}

impl StateTable {
    fn new(ids: &[NodeId]) -> Self {
        let records = ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Mutex::new(NodeRecord {
                        state: NodeState::Pending,
                        outputs: None,
                    }),
                )
            })
            .collect();
        Self { records }
    }

    fn record(&self, id: &NodeId) -> Result<MutexGuard<'_, NodeRecord>> {
        self.records
            .get(id)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or_else(|| Error::Internal(format!("node '{id}' is not part of the plan")))
    }

    fn transition(&self, id: &NodeId, next: NodeState) -> Result<()> {
        let mut record = self.record(id)?;
        if !record.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "invalid state transition for '{id}': {} -> {next}",
                record.state
            )));
        }
        record.state = next;
        Ok(())
    }

    fn complete(&self, id: &NodeId, outputs: OutputAttributes) -> Result<()> {
        let mut record = self.record(id)?;
        if !record.state.can_transition_to(NodeState::Created) {
            return Err(Error::Internal(format!(
                "invalid state transition for '{id}': {} -> created",
                record.state
            )));
        }
        record.state = NodeState::Created;
        record.outputs = Some(outputs);
        Ok(())
    }

    /// Outputs of a node, available only once it is created.
    fn outputs(&self, id: &NodeId) -> Option<OutputAttributes> {
        let record = self.record(id).ok()?;
        match record.state {
            NodeState::Created => record.outputs.clone(),
            _ => None,
        }
    }

    fn snapshot(&self) -> BTreeMap<NodeId, NodeState> {
        self.records
            .iter()
            .map(|(id, m)| (id.clone(), m.lock().unwrap_or_else(PoisonError::into_inner).state))
            .collect()
    }
}

/// Walks a plan and drives the resource provider.
pub struct ProvisioningExecutor {
    provider: Arc<dyn ResourceProvider>,
    secrets: SecretIndirection,
    options: ExecuteOptions,
}

impl ProvisioningExecutor {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        resolver: Arc<dyn SecretResolver>,
        options: ExecuteOptions,
    ) -> Self {
        Self {
            provider,
            secrets: SecretIndirection::new(resolver),
            options,
        }
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    /// Apply a plan, creating or updating every node in dependency order.
    pub async fn apply(&self, plan: &ProvisioningPlan) -> ApplyResult {
        self.apply_inner(plan, &EventSink::default()).await
    }

    /// Apply a plan on a background task, streaming events as it goes.
    pub fn execute(
        self: Arc<Self>,
        plan: Arc<ProvisioningPlan>,
    ) -> (
        mpsc::UnboundedReceiver<ProvisionEvent>,
        tokio::task::JoinHandle<ApplyResult>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let sink = EventSink(Some(tx));
            self.apply_inner(&plan, &sink).await
        });
        (rx, handle)
    }

    /// Delete every node in reverse dependency order.
    pub async fn destroy(&self, plan: &ProvisioningPlan) -> DestroyResult {
        self.destroy_inner(plan, &EventSink::default()).await
    }

    /// Tear a plan down on a background task, streaming events as it goes.
    pub fn execute_destroy(
        self: Arc<Self>,
        plan: Arc<ProvisioningPlan>,
    ) -> (
        mpsc::UnboundedReceiver<ProvisionEvent>,
        tokio::task::JoinHandle<DestroyResult>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let sink = EventSink(Some(tx));
            self.destroy_inner(&plan, &sink).await
        });
        (rx, handle)
    }

    async fn apply_inner(&self, plan: &ProvisioningPlan, events: &EventSink) -> ApplyResult {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let table = StateTable::new(plan.forward());
        let mut changes: HashMap<NodeId, ChangeKind> = HashMap::new();
        let mut failure: Option<(NodeId, Error)> = None;
        let mut cancelled = false;

        info!(
            run_id = %run_id,
            nodes = plan.len(),
            mode = ?self.options.mode,
            policy = ?self.options.policy,
            "Starting provisioning run"
        );

        match self.options.mode {
            ExecutionMode::Sequential => {
                for id in plan.forward() {
                    if self.options.cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }
                    match self.provision_node(plan, &table, id, events).await {
                        Ok(change) => {
                            changes.insert(id.clone(), change);
                        }
                        Err(e) => {
                            failure = Some((id.clone(), e));
                            break;
                        }
                    }
                }
            }
            ExecutionMode::Parallel { workers } => {
                let halted = AtomicBool::new(false);
                let table = &table;
                let halted = &halted;

                for layer in plan.layers() {
                    if self.options.cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }

                    let pending: Vec<BoxFuture<'_, LayerOutcome<'_>>> = layer
                        .iter()
                        .map(|id| self.provision_in_layer(plan, table, id, events, halted).boxed())
                        .collect();
                    let mut results: Vec<LayerOutcome<'_>> = futures::stream::iter(pending)
                        .buffer_unordered(workers.max(1))
                        .collect()
                        .await;
                    results.sort_by_key(|(id, _)| plan.position(id));

                    for (id, result) in results {
                        match result {
                            Some(Ok(change)) => {
                                changes.insert(id.clone(), change);
                            }
                            Some(Err(e)) if failure.is_none() => failure = Some((id.clone(), e)),
                            Some(Err(e)) => {
                                error!(node = %id, error = %e, "Additional failure in layer");
                            }
                            None => cancelled |= self.options.cancel.is_cancelled(),
                        }
                    }

                    if failure.is_some() || cancelled {
                        break;
                    }
                }
            }
        }

        let mut rolled_back_ids = Vec::new();
        let mut rollback_errors = Vec::new();
        let mut rollback_performed = false;

        let (failed_id, error) = match failure {
            Some((failed, e)) => {
                error!(run_id = %run_id, node = %failed, error = %e, "Provisioning failed");
                let report = FailureReport::new(Some(failed.clone()), &e);

                if self.options.policy == FailurePolicy::Rollback {
                    rollback_performed = true;
                    let manifest: HashSet<&NodeId> = changes
                        .iter()
                        .filter(|(_, change)| **change == ChangeKind::Created)
                        .map(|(id, _)| id)
                        .collect();
                    (rolled_back_ids, rollback_errors) =
                        self.rollback(plan, &table, &manifest, events).await;
                    if let Err(e) = table.transition(&failed, NodeState::RolledBack) {
                        warn!(node = %failed, error = %e, "Could not mark failed node rolled back");
                    }
                } else {
                    let created = changes
                        .values()
                        .filter(|change| **change == ChangeKind::Created)
                        .count();
                    warn!(created, "Leaving provisioned resources in place");
                }

                (Some(failed), Some(report))
            }
            None if cancelled => {
                warn!(run_id = %run_id, "Provisioning run cancelled");
                (
                    None,
                    Some(FailureReport {
                        node: None,
                        kind: ErrorKind::Cancelled,
                        message: Error::Cancelled.to_string(),
                    }),
                )
            }
            None => (None, None),
        };

        let by_change = |kind: ChangeKind| -> Vec<NodeId> {
            plan.forward()
                .iter()
                .filter(|id| changes.get(*id) == Some(&kind))
                .cloned()
                .collect()
        };
        let created_ids = by_change(ChangeKind::Created);
        let updated_ids = by_change(ChangeKind::Updated);
        let unchanged_ids = by_change(ChangeKind::Unchanged);

        let success = error.is_none();
        events.emit(ProvisionEvent::RunCompleted { success });
        info!(
            run_id = %run_id,
            success,
            created = created_ids.len(),
            updated = updated_ids.len(),
            unchanged = unchanged_ids.len(),
            rolled_back = rolled_back_ids.len(),
            "Provisioning run finished"
        );

        ApplyResult {
            run_id,
            created_ids,
            updated_ids,
            unchanged_ids,
            failed_id,
            error,
            rollback_performed,
            rolled_back_ids,
            rollback_errors,
            states: table.snapshot(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Provision one node of a parallel layer. Yields `None` once the run
    /// halted or was cancelled.
    async fn provision_in_layer<'a>(
        &self,
        plan: &ProvisioningPlan,
        table: &StateTable,
        id: &'a NodeId,
        events: &EventSink,
        halted: &AtomicBool,
    ) -> LayerOutcome<'a> {
        if halted.load(Ordering::SeqCst) || self.options.cancel.is_cancelled() {
            return (id, None);
        }
        let result = self.provision_node(plan, table, id, events).await;
        if result.is_err() {
            halted.store(true, Ordering::SeqCst);
        }
        (id, Some(result))
    }

    /// Materialize one node: resolve its properties and call the provider.
    async fn provision_node(
        &self,
        plan: &ProvisioningPlan,
        table: &StateTable,
        id: &NodeId,
        events: &EventSink,
    ) -> Result<ChangeKind> {
        let node = plan
            .graph()
            .node(id)
            .ok_or_else(|| Error::Internal(format!("node '{id}' missing from graph")))?;

        table.transition(id, NodeState::InProgress)?;
        events.emit(ProvisionEvent::NodeStarted {
            node: id.clone(),
            kind: node.kind,
        });
        info!(node = %id, kind = %node.kind, "Provisioning node");

        let result = with_retry(
            &self.options.retry,
            move |attempt, e, delay| self.log_retry(id, attempt, e, delay, events),
            move || async move {
                let properties = self.resolve_properties(node, table).await?;
                self.provider
                    .create_or_update(node.kind, &node.id, &properties)
                    .await
            },
        )
        .await;

        match result {
            Ok(outcome) => {
                let change = outcome.change;
                table.complete(id, outcome.outputs)?;
                info!(node = %id, change = %change, "Node provisioned");
                events.emit(ProvisionEvent::NodeCompleted {
                    node: id.clone(),
                    change,
                });
                Ok(change)
            }
            Err(e) => {
                table.transition(id, NodeState::Failed)?;
                error!(node = %id, kind = %node.kind, error = %e, "Node failed");
                events.emit(ProvisionEvent::NodeFailed {
                    node: id.clone(),
                    error: FailureReport::new(Some(id.clone()), &e),
                });
                Err(e)
            }
        }
    }

    /// Resolve literals, references and secrets for one provider call.
    async fn resolve_properties(
        &self,
        node: &ResourceNode,
        table: &StateTable,
    ) -> Result<ResolvedProperties> {
        let mut secrets: HashMap<SecretReference, ResolvedValue> = HashMap::new();
        for reference in node.secret_references() {
            if !secrets.contains_key(reference) {
                let value = self.secrets.resolve(reference).await?;
                secrets.insert(reference.clone(), value);
            }
        }

        let mut properties = ResolvedProperties::new();
        for (key, value) in &node.properties {
            properties.insert(key.clone(), substitute(value, table, &secrets)?);
        }
        Ok(properties)
    }

    async fn rollback(
        &self,
        plan: &ProvisioningPlan,
        table: &StateTable,
        manifest: &HashSet<&NodeId>,
        events: &EventSink,
    ) -> (Vec<NodeId>, Vec<FailureReport>) {
        let mut deleted = Vec::new();
        let mut errors = Vec::new();

        for id in plan.reverse().iter().filter(|id| manifest.contains(id)) {
            let Some(node) = plan.graph().node(id) else {
                continue;
            };
            info!(node = %id, kind = %node.kind, "Rolling back node");

            match self.delete_node(node, events).await {
                Ok(_) => {
                    if let Err(e) = table.transition(id, NodeState::RolledBack) {
                        warn!(node = %id, error = %e, "Could not mark node rolled back");
                    }
                    events.emit(ProvisionEvent::NodeRolledBack { node: id.clone() });
                    deleted.push(id.clone());
                }
                Err(e) => {
                    error!(node = %id, error = %e, "Rollback delete failed");
                    errors.push(FailureReport::new(Some(id.clone()), &e));
                }
            }
        }

        (deleted, errors)
    }

    async fn destroy_inner(&self, plan: &ProvisioningPlan, events: &EventSink) -> DestroyResult {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let mut deleted_ids = Vec::new();
        let mut failed_id = None;
        let mut error = None;

        info!(run_id = %run_id, nodes = plan.len(), "Starting teardown");

        for id in plan.reverse() {
            if self.options.cancel.is_cancelled() {
                warn!(run_id = %run_id, "Teardown cancelled");
                error = Some(FailureReport {
                    node: None,
                    kind: ErrorKind::Cancelled,
                    message: Error::Cancelled.to_string(),
                });
                break;
            }
            let Some(node) = plan.graph().node(id) else {
                continue;
            };
            info!(node = %id, kind = %node.kind, "Deleting node");

            match self.delete_node(node, events).await {
                Ok(existed) => {
                    if existed {
                        deleted_ids.push(id.clone());
                    } else {
                        debug!(node = %id, "Already absent");
                    }
                    events.emit(ProvisionEvent::NodeDeleted {
                        node: id.clone(),
                        existed,
                    });
                }
                Err(e) => {
                    error!(node = %id, error = %e, "Delete failed");
                    let report = FailureReport::new(Some(id.clone()), &e);
                    events.emit(ProvisionEvent::NodeFailed {
                        node: id.clone(),
                        error: report.clone(),
                    });
                    failed_id = Some(id.clone());
                    error = Some(report);
                    break;
                }
            }
        }

        let success = error.is_none();
        events.emit(ProvisionEvent::RunCompleted { success });
        info!(run_id = %run_id, success, deleted = deleted_ids.len(), "Teardown finished");

        DestroyResult {
            run_id,
            deleted_ids,
            failed_id,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Delete one node. Returns whether it existed.
    async fn delete_node(&self, node: &ResourceNode, events: &EventSink) -> Result<bool> {
        let provider = &self.provider;
        with_retry(
            &self.options.retry,
            move |attempt, e, delay| self.log_retry(&node.id, attempt, e, delay, events),
            move || async move {
                match provider.delete(node.kind, &node.id).await {
                    Ok(()) => Ok(true),
                    Err(Error::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    fn log_retry(
        &self,
        node: &NodeId,
        attempt: u32,
        error: &Error,
        delay: Duration,
        events: &EventSink,
    ) {
        warn!(
            node = %node,
            attempt,
            max_attempts = self.options.retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );
        events.emit(ProvisionEvent::NodeRetrying {
            node: node.clone(),
            attempt,
            error: error.to_string(),
        });
    }
}

fn substitute(
    value: &PropertyValue,
    table: &StateTable,
    secrets: &HashMap<SecretReference, ResolvedValue>,
) -> Result<ResolvedValue> {
    match value {
        PropertyValue::Literal(v) => Ok(ResolvedValue::Literal(v.clone())),
        PropertyValue::Reference(reference) => {
            let outputs = table.outputs(&reference.node).ok_or_else(|| {
                Error::Internal(format!(
                    "dependency '{}' has not been created",
                    reference.node
                ))
            })?;
            outputs
                .lookup(&reference.attribute)
                .cloned()
                .map(ResolvedValue::Literal)
                .ok_or_else(|| Error::MissingAttribute {
                    node: reference.node.clone(),
                    attribute: reference.attribute.clone(),
                })
        }
        PropertyValue::Secret(reference) => secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("secret {reference} was not resolved"))),
        PropertyValue::List(items) => items
            .iter()
            .map(|item| substitute(item, table, secrets))
            .collect::<Result<Vec<_>>>()
            .map(ResolvedValue::List),
        PropertyValue::Map(entries) => entries
            .iter()
            .map(|(key, item)| Ok((key.clone(), substitute(item, table, secrets)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(ResolvedValue::Map),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph;
    use crate::plan::schedule;
    use async_trait::async_trait;
    use keystack_core::{
        ExitStatus, ProviderOutcome, ResolutionMode, SecretString,
    };
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockProvider {
        resources: Mutex<HashMap<NodeId, serde_json::Value>>,
        calls: Mutex<Vec<String>>,
        seen: Mutex<HashMap<NodeId, serde_json::Value>>,
        failing: HashSet<NodeId>,
        throttles: Mutex<HashMap<NodeId, u32>>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        cancel_on: Option<(NodeId, CancellationToken)>,
    }

    impl MockProvider {
        fn failing(mut self, id: &str) -> Self {
            self.failing.insert(NodeId::new(id));
            self
        }

        fn throttling(self, id: &str, times: u32) -> Self {
            self.throttles.lock().unwrap().insert(NodeId::new(id), times);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn cancelling_on(mut self, id: &str, token: CancellationToken) -> Self {
            self.cancel_on = Some((NodeId::new(id), token));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn seen(&self, id: &str) -> serde_json::Value {
            self.seen.lock().unwrap()[&NodeId::new(id)].clone()
        }
    }

    #[async_trait]
    impl ResourceProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn create_or_update(
            &self,
            kind: ResourceKind,
            id: &NodeId,
            properties: &ResolvedProperties,
        ) -> Result<ProviderOutcome> {
            self.calls.lock().unwrap().push(format!("create:{id}"));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some((target, token)) = &self.cancel_on {
                if target == id {
                    token.cancel();
                }
            }

            if let Some(remaining) = self.throttles.lock().unwrap().get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Throttled(format!("rate exceeded for {id}")));
                }
            }
            if self.failing.contains(id) {
                return Err(Error::Permission(format!("not allowed to create {id}")));
            }

            let exposed = properties.expose();
            self.seen.lock().unwrap().insert(id.clone(), exposed.clone());

            let mut resources = self.resources.lock().unwrap();
            let change = match resources.get(id) {
                None => ChangeKind::Created,
                Some(previous) if *previous == exposed => ChangeKind::Unchanged,
                Some(_) => ChangeKind::Updated,
            };
            resources.insert(id.clone(), exposed);

            let outputs = OutputAttributes::new()
                .with("arn", format!("arn:mock:{kind}:{id}"))
                .with("poolId", format!("{id}-pool-id"))
                .with("clientId", format!("{id}-client-id"));
            Ok(ProviderOutcome::new(change, outputs))
        }

        async fn delete(&self, _kind: ResourceKind, id: &NodeId) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete:{id}"));
            match self.resources.lock().unwrap().remove(id) {
                Some(_) => Ok(()),
                None => Err(Error::NotFound(id.to_string())),
            }
        }

        async fn describe(
            &self,
            _kind: ResourceKind,
            id: &NodeId,
        ) -> Result<Option<OutputAttributes>> {
            Ok(self
                .resources
                .lock()
                .unwrap()
                .get(id)
                .map(|_| OutputAttributes::new().with("arn", format!("arn:mock:{id}"))))
        }
    }

    #[derive(Default)]
    struct MockResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretResolver for MockResolver {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn resolve(&self, reference: &SecretReference) -> Result<SecretString> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match reference.store.as_str() {
                "app/google" => Ok(SecretString::new("s3cr3t-google")),
                other => Err(Error::SecretNotFound(other.to_string())),
            }
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(5),
        }
    }

    fn options(policy: FailurePolicy) -> ExecuteOptions {
        ExecuteOptions {
            policy,
            retry: fast_retry(),
            ..ExecuteOptions::default()
        }
    }

    /// `n1 <- n2 <- ... <- n{len}`, each depending on the previous.
    fn chain(len: usize) -> ProvisioningPlan {
        let nodes = (1..=len)
            .map(|i| {
                let node = ResourceNode::new(format!("n{i}"), ResourceKind::Pool);
                if i > 1 {
                    node.depends_on(format!("n{}", i - 1))
                } else {
                    node
                }
            })
            .collect();
        schedule(graph::build(nodes).unwrap()).unwrap()
    }

    fn executor(
        provider: Arc<MockProvider>,
        resolver: Arc<MockResolver>,
        options: ExecuteOptions,
    ) -> ProvisioningExecutor {
        ProvisioningExecutor::new(provider, resolver, options)
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[tokio::test]
    async fn test_sequential_apply_substitutes_references() {
        let nodes = vec![
            ResourceNode::new("pool", ResourceKind::Pool),
            ResourceNode::new("client", ResourceKind::Client)
                .with_property("userPoolId", PropertyValue::reference("pool", "poolId"))
                .with_property("clientName", PropertyValue::literal("app")),
        ];
        let plan = schedule(graph::build(nodes).unwrap()).unwrap();
        let provider = Arc::new(MockProvider::default());
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.exit_status(), ExitStatus::Success);
        assert_eq!(result.created_ids, vec![id("pool"), id("client")]);
        assert_eq!(result.state_of(&id("client")), Some(NodeState::Created));
        assert_eq!(provider.calls(), vec!["create:pool", "create:client"]);
        assert_eq!(provider.seen("client")["userPoolId"], "pool-pool-id");
    }

    #[tokio::test]
    async fn test_idempotent_reapply_reports_no_changes() {
        let plan = chain(3);
        let provider = Arc::new(MockProvider::default());
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));

        let first = exec.apply(&plan).await;
        assert_eq!(first.created_ids.len(), 3);

        let second = exec.apply(&plan).await;
        assert!(second.is_success());
        assert!(second.created_ids.is_empty());
        assert!(second.updated_ids.is_empty());
        assert_eq!(second.unchanged_ids, vec![id("n1"), id("n2"), id("n3")]);
    }

    #[tokio::test]
    async fn test_fatal_failure_halts_and_leaves_resources() {
        let plan = chain(5);
        let provider = Arc::new(MockProvider::default().failing("n3"));
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;

        assert_eq!(result.state_of(&id("n1")), Some(NodeState::Created));
        assert_eq!(result.state_of(&id("n2")), Some(NodeState::Created));
        assert_eq!(result.state_of(&id("n3")), Some(NodeState::Failed));
        assert_eq!(result.state_of(&id("n4")), Some(NodeState::Pending));
        assert_eq!(result.state_of(&id("n5")), Some(NodeState::Pending));
        assert_eq!(result.failed_id, Some(id("n3")));
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Permission);
        assert_eq!(result.created_ids, vec![id("n1"), id("n2")]);
        assert_eq!(result.exit_status(), ExitStatus::LeftInPlace);
        assert_eq!(result.exit_status().code(), 2);
        assert_eq!(provider.calls(), vec!["create:n1", "create:n2", "create:n3"]);
    }

    #[tokio::test]
    async fn test_rollback_policy_deletes_in_reverse_order() {
        let plan = chain(5);
        let provider = Arc::new(MockProvider::default().failing("n3"));
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Rollback));

        let result = exec.apply(&plan).await;

        assert_eq!(result.exit_status().code(), 1);
        assert_eq!(result.rolled_back_ids, vec![id("n2"), id("n1")]);
        assert!(result.rollback_errors.is_empty());
        assert_eq!(result.state_of(&id("n1")), Some(NodeState::RolledBack));
        assert_eq!(result.state_of(&id("n3")), Some(NodeState::RolledBack));
        assert_eq!(result.state_of(&id("n4")), Some(NodeState::Pending));
        assert_eq!(
            provider.calls(),
            vec!["create:n1", "create:n2", "create:n3", "delete:n2", "delete:n1"]
        );
    }

    #[tokio::test]
    async fn test_rollback_spares_preexisting_resources() {
        let plan = chain(3);
        let provider = Arc::new(MockProvider::default());
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));
        exec.apply(&chain(1)).await;

        let failing = Arc::new(MockProvider {
            resources: Mutex::new(provider.resources.lock().unwrap().clone()),
            ..MockProvider::default().failing("n3")
        });
        let exec = executor(failing.clone(), Arc::default(), options(FailurePolicy::Rollback));
        let result = exec.apply(&plan).await;

        assert_eq!(result.unchanged_ids, vec![id("n1")]);
        assert_eq!(result.created_ids, vec![id("n2")]);
        assert_eq!(result.rolled_back_ids, vec![id("n2")]);
        assert_eq!(result.state_of(&id("n1")), Some(NodeState::Created));
        assert!(!failing.calls().contains(&"delete:n1".to_string()));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let plan = chain(2);
        let provider = Arc::new(MockProvider::default().throttling("n2", 2));
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(
            provider.calls(),
            vec!["create:n1", "create:n2", "create:n2", "create:n2"]
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_fatal() {
        let plan = chain(2);
        let provider = Arc::new(MockProvider::default().throttling("n1", 10));
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;

        assert_eq!(result.failed_id, Some(id("n1")));
        assert_eq!(
            result.error.as_ref().unwrap().kind,
            ErrorKind::RetriesExhausted
        );
        assert_eq!(provider.calls().len(), 3);
        assert_eq!(result.state_of(&id("n2")), Some(NodeState::Pending));
    }

    fn provider_node(id: &str, store: &str, mode: ResolutionMode) -> ResourceNode {
        ResourceNode::new(id, ResourceKind::IdentityProvider)
            .with_property("userPoolId", PropertyValue::reference("pool", "poolId"))
            .with_property("providerType", PropertyValue::literal("Google"))
            .with_property("clientId", PropertyValue::literal("google-client-id"))
            .with_property(
                "clientSecret",
                SecretReference::new(store, None, mode).into(),
            )
    }

    #[tokio::test]
    async fn test_secrets_reach_provider_but_never_the_result() {
        let nodes = vec![
            ResourceNode::new("pool", ResourceKind::Pool),
            provider_node("google", "app/google", ResolutionMode::Eager),
        ];
        let plan = schedule(graph::build(nodes).unwrap()).unwrap();
        let provider = Arc::new(MockProvider::default());
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(provider.seen("google")["clientSecret"], "s3cr3t-google");

        let persisted = serde_json::to_string(&result).unwrap();
        let planned = serde_json::to_string(&plan).unwrap();
        let declared = serde_json::to_string(plan.graph().nodes()).unwrap();
        for text in [persisted, planned, declared] {
            assert!(!text.contains("s3cr3t-google"));
        }
    }

    #[tokio::test]
    async fn test_deferred_secret_skips_resolver() {
        let nodes = vec![
            ResourceNode::new("pool", ResourceKind::Pool),
            provider_node("facebook", "app/facebook", ResolutionMode::Deferred),
        ];
        let plan = schedule(graph::build(nodes).unwrap()).unwrap();
        let provider = Arc::new(MockProvider::default());
        let resolver = Arc::new(MockResolver::default());
        let exec = executor(provider.clone(), resolver.clone(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            provider.seen("facebook")["clientSecret"],
            "{{resolve:secretsmanager:app/facebook:SecretString:}}"
        );
    }

    #[tokio::test]
    async fn test_missing_secret_fails_node() {
        let nodes = vec![
            ResourceNode::new("pool", ResourceKind::Pool),
            provider_node("google", "app/unknown", ResolutionMode::Eager),
        ];
        let plan = schedule(graph::build(nodes).unwrap()).unwrap();
        let provider = Arc::new(MockProvider::default());
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;

        assert_eq!(result.failed_id, Some(id("google")));
        assert_eq!(result.error.unwrap().kind, ErrorKind::SecretNotFound);
        assert_eq!(provider.calls(), vec!["create:pool"]);
    }

    #[tokio::test]
    async fn test_missing_output_attribute_fails_node() {
        let nodes = vec![
            ResourceNode::new("pool", ResourceKind::Pool),
            ResourceNode::new("client", ResourceKind::Client)
                .with_property("userPoolId", PropertyValue::reference("pool", "nonexistent")),
        ];
        let plan = schedule(graph::build(nodes).unwrap()).unwrap();
        let exec = executor(Arc::default(), Arc::default(), options(FailurePolicy::Halt));

        let result = exec.apply(&plan).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::MissingAttribute);
    }

    #[tokio::test]
    async fn test_parallel_mode_bounds_workers_per_layer() {
        let mut nodes = vec![ResourceNode::new("root", ResourceKind::Pool)];
        for i in 0..6 {
            nodes.push(ResourceNode::new(format!("leaf{i}"), ResourceKind::Pool).depends_on("root"));
        }
        let plan = schedule(graph::build(nodes).unwrap()).unwrap();
        let provider = Arc::new(MockProvider::default().with_delay(Duration::from_millis(20)));
        let exec = executor(
            provider.clone(),
            Arc::default(),
            ExecuteOptions {
                mode: ExecutionMode::Parallel { workers: 2 },
                ..options(FailurePolicy::Halt)
            },
        );

        let result = exec.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.created_ids.len(), 7);
        assert_eq!(result.created_ids[0], id("root"));
        assert_eq!(provider.calls()[0], "create:root");
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_parallel_failure_stops_later_layers() {
        let nodes = vec![
            ResourceNode::new("a", ResourceKind::Pool),
            ResourceNode::new("b", ResourceKind::Pool),
            ResourceNode::new("c", ResourceKind::Pool).depends_on("a"),
        ];
        let plan = schedule(graph::build(nodes).unwrap()).unwrap();
        let provider = Arc::new(MockProvider::default().failing("b"));
        let exec = executor(
            provider.clone(),
            Arc::default(),
            ExecuteOptions {
                mode: ExecutionMode::Parallel { workers: 4 },
                ..options(FailurePolicy::Halt)
            },
        );

        let result = exec.apply(&plan).await;

        assert_eq!(result.failed_id, Some(id("b")));
        assert_eq!(result.state_of(&id("a")), Some(NodeState::Created));
        assert_eq!(result.state_of(&id("c")), Some(NodeState::Pending));
        assert!(!provider.calls().contains(&"create:c".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_before_start_touches_nothing() {
        let plan = chain(3);
        let provider = Arc::new(MockProvider::default());
        let opts = options(FailurePolicy::Rollback);
        opts.cancel.cancel();
        let exec = executor(provider.clone(), Arc::default(), opts);

        let result = exec.apply(&plan).await;

        assert!(provider.calls().is_empty());
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert!(!result.rollback_performed);
        assert_eq!(result.exit_status(), ExitStatus::LeftInPlace);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_call_finish() {
        let plan = chain(4);
        let opts = options(FailurePolicy::Halt);
        let provider = Arc::new(MockProvider::default().cancelling_on("n2", opts.cancel.clone()));
        let exec = executor(provider.clone(), Arc::default(), opts);

        let result = exec.apply(&plan).await;

        assert_eq!(result.created_ids, vec![id("n1"), id("n2")]);
        assert_eq!(result.state_of(&id("n3")), Some(NodeState::Pending));
        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_destroy_runs_in_reverse_and_ignores_missing() {
        let plan = chain(3);
        let provider = Arc::new(MockProvider::default());
        let exec = executor(provider.clone(), Arc::default(), options(FailurePolicy::Halt));
        exec.apply(&chain(2)).await;

        let result = exec.destroy(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.deleted_ids, vec![id("n2"), id("n1")]);
        assert_eq!(
            provider.calls(),
            vec!["create:n1", "create:n2", "delete:n3", "delete:n2", "delete:n1"]
        );
    }

    #[tokio::test]
    async fn test_execute_streams_events() {
        let plan = Arc::new(chain(2));
        let exec = Arc::new(executor(
            Arc::default(),
            Arc::default(),
            options(FailurePolicy::Halt),
        ));

        let (mut rx, handle) = exec.execute(plan);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let result = handle.await.unwrap();

        assert!(result.is_success());
        assert!(matches!(events.first(), Some(ProvisionEvent::NodeStarted { node, .. }) if node.as_str() == "n1"));
        assert!(matches!(events.last(), Some(ProvisionEvent::RunCompleted { success: true })));
        let completed = events
            .iter()
            .filter(|e| matches!(e, ProvisionEvent::NodeCompleted { change: ChangeKind::Created, .. }))
            .count();
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn test_execute_streams_parallel_run() {
        let mut nodes = vec![ResourceNode::new("root", ResourceKind::Pool)];
        for i in 0..4 {
            nodes.push(ResourceNode::new(format!("leaf{i}"), ResourceKind::Pool).depends_on("root"));
        }
        let plan = Arc::new(schedule(graph::build(nodes).unwrap()).unwrap());
        let provider = Arc::new(MockProvider::default().with_delay(Duration::from_millis(5)));
        let exec = Arc::new(executor(
            provider.clone(),
            Arc::default(),
            ExecuteOptions {
                mode: ExecutionMode::Parallel { workers: 3 },
                ..options(FailurePolicy::Halt)
            },
        ));

        let (mut rx, handle) = exec.execute(plan);
        let mut completed = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, ProvisionEvent::NodeCompleted { .. }) {
                completed += 1;
            }
        }
        let result = handle.await.unwrap();

        assert!(result.is_success());
        assert_eq!(completed, 5);
        assert_eq!(result.created_ids[0], id("root"));
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancellation_under_rollback_keeps_created_resources() {
        let plan = chain(4);
        let opts = options(FailurePolicy::Rollback);
        let provider = Arc::new(MockProvider::default().cancelling_on("n2", opts.cancel.clone()));
        let exec = executor(provider.clone(), Arc::default(), opts);

        let result = exec.apply(&plan).await;

        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert!(!result.rollback_performed);
        assert!(result.rolled_back_ids.is_empty());
        assert_eq!(result.created_ids, vec![id("n1"), id("n2")]);
        assert_eq!(result.exit_status(), ExitStatus::LeftInPlace);
        assert_eq!(result.exit_status().code(), 2);
        assert!(!provider.calls().iter().any(|call| call.starts_with("delete:")));
        assert!(provider.resources.lock().unwrap().contains_key(&id("n1")));
        assert!(provider.resources.lock().unwrap().contains_key(&id("n2")));
    }
}
