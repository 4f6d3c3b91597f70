//! Error types for keystack.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::NodeId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cycle detected in dependencies: {}", format_path(.0))]
    Cycle(Vec<NodeId>),

    #[error("node '{from}' references unknown node '{target}'")]
    UnknownReference { from: NodeId, target: NodeId },

    #[error("duplicate node id: {0}")]
    DuplicateId(NodeId),

    #[error("invalid properties for node '{node}': {message}")]
    Schema { node: NodeId, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("node '{node}' requires replacement, immutable properties changed: {}", .properties.join(", "))]
    ReplacementRequired {
        node: NodeId,
        properties: Vec<String>,
    },

    #[error("node '{node}' has no output attribute '{attribute}'")]
    MissingAttribute { node: NodeId, attribute: String },

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Machine-readable error classification reported in run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cycle,
    UnknownReference,
    DuplicateId,
    Schema,
    Validation,
    Conflict,
    Permission,
    ReplacementRequired,
    MissingAttribute,
    Throttled,
    Transient,
    RetriesExhausted,
    SecretNotFound,
    NotFound,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Cycle(_) => ErrorKind::Cycle,
            Error::UnknownReference { .. } => ErrorKind::UnknownReference,
            Error::DuplicateId(_) => ErrorKind::DuplicateId,
            Error::Schema { .. } => ErrorKind::Schema,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Permission(_) => ErrorKind::Permission,
            Error::ReplacementRequired { .. } => ErrorKind::ReplacementRequired,
            Error::MissingAttribute { .. } => ErrorKind::MissingAttribute,
            Error::Throttled(_) => ErrorKind::Throttled,
            Error::Transient(_) => ErrorKind::Transient,
            Error::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Error::SecretNotFound(_) => ErrorKind::SecretNotFound,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Throttling and network/timeout failures are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Throttled(_) | Error::Transient(_))
    }

    /// Raised before any provider call is made.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Error::Cycle(_)
                | Error::UnknownReference { .. }
                | Error::DuplicateId(_)
                | Error::Schema { .. }
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Cycle => "cycle",
            ErrorKind::UnknownReference => "unknown_reference",
            ErrorKind::DuplicateId => "duplicate_id",
            ErrorKind::Schema => "schema",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Permission => "permission",
            ErrorKind::ReplacementRequired => "replacement_required",
            ErrorKind::MissingAttribute => "missing_attribute",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Transient => "transient",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::SecretNotFound => "secret_not_found",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
