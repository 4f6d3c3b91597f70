//! Per-node provisioning state and run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, ErrorKind, NodeId, RunId};

/// Provisioning state of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    InProgress,
    Created,
    Failed,
    RolledBack,
}

impl NodeState {
    /// Allowed transitions. State only moves forward, apart from a failed or
    /// created node being rolled back.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Pending, NodeState::InProgress)
                | (NodeState::InProgress, NodeState::Created)
                | (NodeState::InProgress, NodeState::Failed)
                | (NodeState::Created, NodeState::RolledBack)
                | (NodeState::Failed, NodeState::RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Created | NodeState::Failed | NodeState::RolledBack
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Pending => write!(f, "pending"),
            NodeState::InProgress => write!(f, "in_progress"),
            NodeState::Created => write!(f, "created"),
            NodeState::Failed => write!(f, "failed"),
            NodeState::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// An error attributed to a node, safe to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub node: Option<NodeId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureReport {
    pub fn new(node: Option<NodeId>, error: &Error) -> Self {
        Self {
            node,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Process exit status derived from a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Full success.
    Success,
    /// Fatal failure, resources created by the run were rolled back.
    RolledBack,
    /// Fatal failure, resources left in place.
    LeftInPlace,
    /// Cycle or unknown reference found before any resource was touched.
    PlanningError,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::RolledBack => 1,
            ExitStatus::LeftInPlace => 2,
            ExitStatus::PlanningError => 3,
        }
    }

    pub fn from_error(error: &Error) -> Self {
        if error.is_planning() {
            ExitStatus::PlanningError
        } else {
            ExitStatus::LeftInPlace
        }
    }
}

/// Summary of an apply run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    pub run_id: RunId,
    /// Nodes this run created, in plan order.
    pub created_ids: Vec<NodeId>,
    /// Pre-existing nodes updated in place.
    pub updated_ids: Vec<NodeId>,
    /// Pre-existing nodes the provider reported as unchanged.
    pub unchanged_ids: Vec<NodeId>,
    pub failed_id: Option<NodeId>,
    pub error: Option<FailureReport>,
    /// Whether the rollback policy ran after a fatal failure.
    pub rollback_performed: bool,
    /// Nodes deleted by rollback, in deletion order.
    pub rolled_back_ids: Vec<NodeId>,
    pub rollback_errors: Vec<FailureReport>,
    pub states: BTreeMap<NodeId, NodeState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_status(&self) -> ExitStatus {
        match (&self.error, self.rollback_performed) {
            (None, _) => ExitStatus::Success,
            (Some(_), true) => ExitStatus::RolledBack,
            (Some(_), false) => ExitStatus::LeftInPlace,
        }
    }

    pub fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        self.states.get(id).copied()
    }
}

/// Summary of a teardown run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResult {
    pub run_id: RunId,
    /// Nodes deleted, in deletion order.
    pub deleted_ids: Vec<NodeId>,
    pub failed_id: Option<NodeId>,
    pub error: Option<FailureReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DestroyResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.error.is_none() {
            ExitStatus::Success
        } else {
            ExitStatus::LeftInPlace
        }
    }
}
