//! Deployment and deletion orchestrators
//!
//! The deployment orchestrator walks the dependency graph in apply order:
//! render, apply each output resource through its handler, resolve computed
//! values from the backend-reported properties, and persist the resource
//! record before the next dependent node renders. The walk stops at the
//! first error; what was applied stays applied, and the error names exactly
//! which resources succeeded and which one failed so the caller can retry
//! (apply is idempotent) or tear down.
//!
//! Deletion walks the same graph in the exact reverse order, and each
//! resource's outputs in reverse of their apply order. Not-found at any
//! level means already deleted and is skipped, so deletion is idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::definition::{ResourceDefinition, ResourceId};
use crate::graph::DependencyGraph;
use crate::handler::HandlerRegistry;
use crate::render::RendererRegistry;
use crate::store::{ResourceData, ResourceDataStore};
use crate::values::{properties_to_value, resolve_computed_values, ResolvedOutputs};
use crate::{Error, Result};

/// Outcome of a completed deployment operation
#[derive(Debug)]
pub struct DeploymentSummary {
    /// Operation id, for log correlation
    pub operation: Uuid,
    /// Every resource deployed, in apply order
    pub deployed: Vec<ResourceId>,
    /// Resolved computed values of every deployed resource
    pub resolved: ResolvedOutputs,
}

/// Outcome of a completed deletion operation
#[derive(Debug)]
pub struct DeletionSummary {
    /// Operation id, for log correlation
    pub operation: Uuid,
    /// Resources whose outputs were deleted (or found absent), in delete order
    pub deleted: Vec<ResourceId>,
}

/// Applies a definition set in dependency order
pub struct DeploymentOrchestrator {
    renderers: RendererRegistry,
    handlers: HandlerRegistry,
    store: Arc<dyn ResourceDataStore>,
}

impl DeploymentOrchestrator {
    /// Create an orchestrator over the given registries and store
    pub fn new(
        renderers: RendererRegistry,
        handlers: HandlerRegistry,
        store: Arc<dyn ResourceDataStore>,
    ) -> Self {
        Self {
            renderers,
            handlers,
            store,
        }
    }

    /// Deploy a definition set
    ///
    /// The dependency graph (explicit references plus renderer-derived ones)
    /// is validated before any side effect: cyclic input or references to
    /// resources outside the set fail here, and nothing is applied.
    pub async fn deploy(&self, definitions: &[ResourceDefinition]) -> Result<DeploymentSummary> {
        let operation = Uuid::new_v4();
        let graph =
            DependencyGraph::build_with(definitions, |def| self.renderers.dependency_ids(def))?;

        info!(%operation, resources = definitions.len(), "starting deployment");

        let mut resolved = ResolvedOutputs::new();
        let mut deployed: Vec<ResourceId> = Vec::new();
        for definition in graph.apply_order(definitions) {
            match self.deploy_one(operation, definition, &resolved).await {
                Ok(values) => {
                    resolved.insert(definition.id.clone(), values);
                    deployed.push(definition.id.clone());
                }
                Err(source) => {
                    warn!(%operation, resource = %definition.id, error = %source,
                        "deployment stopped at failed resource");
                    return Err(Error::Deployment {
                        operation,
                        succeeded: deployed,
                        failed: definition.id.clone(),
                        source: Box::new(source),
                    });
                }
            }
        }

        info!(%operation, deployed = deployed.len(), "deployment complete");
        Ok(DeploymentSummary {
            operation,
            deployed,
            resolved,
        })
    }

    /// Render, apply, resolve, and persist one resource
    async fn deploy_one(
        &self,
        operation: Uuid,
        definition: &ResourceDefinition,
        resolved: &ResolvedOutputs,
    ) -> Result<BTreeMap<String, Value>> {
        debug!(%operation, resource = %definition.id, resource_type = %definition.resource_type,
            "rendering resource");
        let rendered = self.renderers.render(definition, resolved)?;

        let mut record = ResourceData::new(definition.id.clone());
        record.secret_values = rendered.secret_values;

        let mut reported: BTreeMap<String, Value> = BTreeMap::new();
        for output in rendered.resources {
            let handler = self.handlers.handler_for(output.provider)?;
            debug!(%operation, resource = %definition.id, local_id = %output.local_id,
                provider = %output.provider, "applying output resource");
            let response = handler.put(&output).await?;

            let properties = properties_to_value(&response.properties);
            reported.insert(output.local_id.clone(), properties.clone());
            record
                .reported_properties
                .insert(output.local_id.clone(), properties);

            let mut applied = output;
            // Pre-existing outputs come back with no identity; deletion
            // skips them because the engine never applied them.
            applied.identity = response.identity;
            record.output_resources.push(applied);
        }

        let values = resolve_computed_values(&definition.id, &rendered.computed_values, &reported)?;
        record.resolved_values = values.clone();

        // Persisted before the next dependent renders, so a crash between
        // nodes never loses an applied resource's identities.
        self.store.save(&record).await?;
        info!(%operation, resource = %definition.id,
            outputs = record.output_resources.len(), "resource deployed");
        Ok(values)
    }
}

/// Tears a definition set down in reverse dependency order
pub struct DeletionOrchestrator {
    renderers: RendererRegistry,
    handlers: HandlerRegistry,
    store: Arc<dyn ResourceDataStore>,
}

impl DeletionOrchestrator {
    /// Create an orchestrator over the given registries and store
    ///
    /// The renderer registry is only consulted for dependency scans, so the
    /// deletion order mirrors the deployment order exactly.
    pub fn new(
        renderers: RendererRegistry,
        handlers: HandlerRegistry,
        store: Arc<dyn ResourceDataStore>,
    ) -> Self {
        Self {
            renderers,
            handlers,
            store,
        }
    }

    /// Delete a definition set
    ///
    /// Resources are visited in the exact reverse of the apply order, and
    /// each resource's outputs in reverse of their order within the record.
    /// A missing record or a not-found backend object means already deleted;
    /// both are skipped and the walk continues.
    pub async fn delete(&self, definitions: &[ResourceDefinition]) -> Result<DeletionSummary> {
        let operation = Uuid::new_v4();
        let graph =
            DependencyGraph::build_with(definitions, |def| self.renderers.dependency_ids(def))?;

        info!(%operation, resources = definitions.len(), "starting deletion");

        let mut deleted: Vec<ResourceId> = Vec::new();
        for definition in graph.delete_order(definitions) {
            self.delete_one(operation, definition).await?;
            deleted.push(definition.id.clone());
        }

        info!(%operation, deleted = deleted.len(), "deletion complete");
        Ok(DeletionSummary { operation, deleted })
    }

    async fn delete_one(&self, operation: Uuid, definition: &ResourceDefinition) -> Result<()> {
        let record = match self.store.load(&definition.id).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => {
                debug!(%operation, resource = %definition.id, "no record, already deleted");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for output in record.output_resources.iter().rev() {
            // No identity means the engine never applied this output
            // (pre-existing), so it is not the engine's to delete.
            let Some(identity) = output.identity.as_ref() else {
                debug!(%operation, resource = %definition.id, local_id = %output.local_id,
                    "skipping pre-existing output");
                continue;
            };
            let handler = self.handlers.handler_for(output.provider)?;
            debug!(%operation, resource = %definition.id, local_id = %output.local_id,
                "deleting output resource");
            handler
                .delete(identity)
                .await
                .map_err(|err| Error::Delete {
                    resource: definition.id.clone(),
                    local_id: output.local_id.clone(),
                    message: err.to_string(),
                })?;
        }

        match self.store.delete(&definition.id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        info!(%operation, resource = %definition.id, "resource deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::lookup_path;

    #[test]
    fn summaries_expose_operation_ids() {
        let summary = DeploymentSummary {
            operation: Uuid::nil(),
            deployed: vec![ResourceId::new("app/db")],
            resolved: ResolvedOutputs::new(),
        };
        assert_eq!(summary.operation, Uuid::nil());
        assert_eq!(summary.deployed.len(), 1);
        // Debug formatting is relied on by callers logging summaries.
        assert!(format!("{summary:?}").contains("app/db"));
    }

    #[test]
    fn reported_properties_shape_is_addressable() {
        let mut properties = BTreeMap::new();
        properties.insert("namespace".to_owned(), "prod".to_owned());
        let value = properties_to_value(&properties);
        assert_eq!(
            lookup_path(&value, "namespace"),
            Some(&Value::String("prod".to_owned()))
        );
    }
}
