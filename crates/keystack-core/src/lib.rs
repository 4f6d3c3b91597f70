//! Core domain types and capability traits for keystack.
//!
//! This crate contains:
//! - Node and run identifiers
//! - Resource nodes, kinds and their property schemas
//! - The `ResourceProvider` capability (cloud control plane)
//! - The `SecretResolver` capability and secret references
//! - Per-node provisioning state and run results
//! - The error taxonomy shared by planning and execution

pub mod error;
pub mod id;
pub mod node;
pub mod provider;
pub mod secret;
pub mod stack;

pub use error::{Error, ErrorKind, Result};
pub use id::{NodeId, RunId};
pub use node::{AttributeRef, PropertyValue, ResourceKind, ResourceNode};
pub use provider::{
    ChangeKind, OutputAttributes, ProviderOutcome, ResolvedProperties, ResolvedValue,
    ResourceProvider,
};
pub use secret::{ResolutionMode, SecretReference, SecretResolver, SecretString, SecretValue};
pub use stack::{ApplyResult, DestroyResult, ExitStatus, FailureReport, NodeState};
