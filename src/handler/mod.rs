//! Resource handler contract and dispatch
//!
//! A resource handler applies or deletes one output resource against its
//! backend. The contract is small: `put` returns the backend-assigned
//! identity and a flat map of reported properties; `delete` takes the
//! identity and treats not-found as success, which is required because
//! delete may run again after a prior partial success.
//!
//! Dispatch is a table keyed by backend provider tag, built once at startup.

pub mod kubernetes;

pub use kubernetes::KubernetesHandler;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::output::{OutputResource, Provider, ResourceIdentity};
use crate::{Error, Result};

/// Result of applying one output resource
#[derive(Clone, Debug)]
pub struct PutResponse {
    /// Backend-assigned identity; absent for pre-existing (`deployed`)
    /// resources, which the engine never applied and will never delete
    pub identity: Option<ResourceIdentity>,
    /// Backend-reported properties, merged into the resolved-value store
    pub properties: BTreeMap<String, String>,
}

/// Per-backend apply/delete of one output resource
///
/// `put` must be idempotent: repeating it with the same desired state
/// produces no additional change. That property is what makes retrying a
/// failed deployment from the top safe.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Create or update the resource described by the payload
    async fn put(&self, output: &OutputResource) -> Result<PutResponse>;

    /// Delete the resource behind an identity; not-found is success
    async fn delete(&self, identity: &ResourceIdentity) -> Result<()>;
}

impl std::fmt::Debug for dyn ResourceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResourceHandler")
    }
}

/// Dispatch table from backend provider tag to handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Provider, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a provider
    pub fn register(&mut self, provider: Provider, handler: Arc<dyn ResourceHandler>) {
        self.handlers.insert(provider, handler);
    }

    /// Look up the handler for a provider
    pub fn handler_for(&self, provider: Provider) -> Result<&Arc<dyn ResourceHandler>> {
        self.handlers.get(&provider).ok_or_else(|| Error::UnknownProvider {
            provider: provider.to_string(),
        })
    }
}
