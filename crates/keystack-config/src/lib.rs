//! KDL configuration parsing for keystack.
//!
//! This crate handles:
//! - Topology definitions (pools, providers, clients, functions, ...)
//! - The executor `settings` block
//! - Variable interpolation
//! - Composing a topology into resource nodes

pub mod composer;
pub mod error;
pub mod settings;
pub mod topology;
pub mod variables;

pub use composer::{StackComposer, compose};
pub use error::{ConfigError, ConfigResult};
pub use settings::ExecutorSettings;
pub use topology::{TopologySpec, load_topology, parse_duration, parse_topology};
pub use variables::{VariableContext, VariableContextBuilder};
