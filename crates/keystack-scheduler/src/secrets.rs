//! Secret indirection.
//!
//! Secret references are materialized only at the moment a node's provider
//! call is prepared. Eager references are fetched from the resolver; deferred
//! references become dynamic-reference tokens without touching the store.

use keystack_core::{ResolutionMode, ResolvedValue, Result, SecretReference, SecretResolver};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct SecretIndirection {
    resolver: Arc<dyn SecretResolver>,
}

impl SecretIndirection {
    pub fn new(resolver: Arc<dyn SecretResolver>) -> Self {
        Self { resolver }
    }

    pub async fn resolve(&self, reference: &SecretReference) -> Result<ResolvedValue> {
        match reference.mode {
            ResolutionMode::Eager => {
                debug!(secret = %reference, resolver = self.resolver.name(), "Resolving secret");
                let value = self.resolver.resolve(reference).await?;
                Ok(ResolvedValue::Secret(value))
            }
            ResolutionMode::Deferred => Ok(ResolvedValue::Deferred(
                self.resolver.dynamic_reference(reference),
            )),
        }
    }
}

impl std::fmt::Debug for SecretIndirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretIndirection")
            .field("resolver", &self.resolver.name())
            .finish()
    }
}
