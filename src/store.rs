//! Per-resource deployment records and their persistence
//!
//! [`ResourceData`] is the durable record of one resource's deployment: its
//! output resources (with identities), resolved computed values, secret
//! values, and any recipe-supplied metadata. It is the sole input to deletion
//! and later reads, and must be persisted before the next dependent node
//! renders. [`ResourceDataStore`] is the persistence seam; [`InMemoryStore`]
//! backs tests and embedders without a durable backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::ResourceId;
use crate::output::OutputResource;
use crate::{Error, Result};

/// Durable record of one resource's deployment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceData {
    /// The resource this record belongs to
    pub id: ResourceId,
    /// Output resources in apply order, with backend identities
    pub output_resources: Vec<OutputResource>,
    /// Resolved computed values, by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_values: BTreeMap<String, Value>,
    /// Secret-valued outputs, excluded from the plain resolved view
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_values: BTreeMap<String, Value>,
    /// Backend-reported properties per output resource local id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reported_properties: BTreeMap<String, Value>,
    /// Opaque recipe-supplied metadata persisted with the record
    ///
    /// Populated by the embedder when an external recipe produced the
    /// resource; the engine only carries it through save and load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_metadata: Option<Value>,
}

impl ResourceData {
    /// Create an empty record for a resource
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            output_resources: Vec::new(),
            resolved_values: BTreeMap::new(),
            secret_values: BTreeMap::new(),
            reported_properties: BTreeMap::new(),
            recipe_metadata: None,
        }
    }
}

/// Persistence seam for resource deployment records
///
/// `load` and `delete` distinguish not-found from other failures:
/// [`Error::NotFound`] lets deletion treat an absent record as
/// already-deleted success.
#[async_trait]
pub trait ResourceDataStore: Send + Sync {
    /// Persist a record, replacing any previous version
    async fn save(&self, data: &ResourceData) -> Result<()>;

    /// Load a record; [`Error::NotFound`] when absent
    async fn load(&self, id: &ResourceId) -> Result<ResourceData>;

    /// Remove a record; [`Error::NotFound`] when absent
    async fn delete(&self, id: &ResourceId) -> Result<()>;
}

/// In-memory store backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<ResourceId, ResourceData>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceDataStore for InMemoryStore {
    async fn save(&self, data: &ResourceData) -> Result<()> {
        self.records.insert(data.id.clone(), data.clone());
        Ok(())
    }

    async fn load(&self, id: &ResourceId) -> Result<ResourceData> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound {
                resource: id.clone(),
            })
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound {
                resource: id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputResource;

    #[tokio::test]
    async fn save_load_roundtrip() {
        let store = InMemoryStore::new();
        let mut data = ResourceData::new(ResourceId::new("app/db"));
        data.output_resources.push(OutputResource::kubernetes(
            "service",
            serde_json::json!({"apiVersion": "v1", "kind": "Service"}),
        ));
        data.resolved_values
            .insert("host".to_string(), serde_json::json!("svc-a"));
        data.recipe_metadata = Some(serde_json::json!({"recipe": "redis", "version": "7"}));

        store.save(&data).await.expect("save");
        let loaded = store.load(&ResourceId::new("app/db")).await.expect("load");
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn load_of_missing_record_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.load(&ResourceId::new("app/gone")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_and_reports_not_found_after() {
        let store = InMemoryStore::new();
        let data = ResourceData::new(ResourceId::new("app/db"));
        store.save(&data).await.expect("save");

        store.delete(&ResourceId::new("app/db")).await.expect("delete");
        let err = store.delete(&ResourceId::new("app/db")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
