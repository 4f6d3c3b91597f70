//! Planning and execution for keystack.
//!
//! Builds the dependency graph from resource nodes, orders it, and walks
//! the resulting plan against a resource provider.

pub mod graph;
pub mod orchestrator;
pub mod plan;
pub mod retry;
pub mod secrets;

pub use graph::{Edge, EdgeOrigin, Graph, GraphBuilder};
pub use orchestrator::{
    ExecuteOptions, ExecutionMode, FailurePolicy, ProvisionEvent, ProvisioningExecutor,
};
pub use plan::{ProvisioningPlan, respects_dependencies, schedule};
pub use retry::{RetryConfig, with_retry};
pub use secrets::SecretIndirection;
