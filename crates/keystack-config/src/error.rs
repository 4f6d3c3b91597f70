//! Topology loading errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("topology is not valid KDL: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing {0}")]
    MissingField(String),

    #[error("bad {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("declared more than once: {0}")]
    Duplicate(String),

    /// A name that does not resolve to a declared pool, provider,
    /// function, bucket or domain.
    #[error("unresolved reference: {0}")]
    InvalidReference(String),

    #[error("cannot read topology: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
