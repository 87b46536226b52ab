//! Renderer contract and dispatch
//!
//! A renderer is the pure, per-resource-type transformation from a
//! definition plus its dependencies' resolved outputs into backend-bound
//! output resources and computed value references. Renderers never apply
//! anything themselves.
//!
//! Dispatch is a table keyed by resource type tag, resolved once at
//! construction, instead of scattering type conditionals through the
//! orchestrator.

mod container;
mod route;

pub use container::ContainerRenderer;
pub use route::RouteRenderer;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::definition::{ResourceDefinition, ResourceId};
use crate::output::OutputResource;
use crate::values::{ComputedValueReference, ResolvedOutputs};
use crate::{Error, Result};

/// Result of rendering one resource definition
#[derive(Clone, Debug, Default)]
pub struct RendererOutput {
    /// Output resources in apply order
    pub resources: Vec<OutputResource>,
    /// Computed value references, by output value name
    pub computed_values: BTreeMap<String, ComputedValueReference>,
    /// Secret-valued outputs, kept out of the plain resolved view
    pub secret_values: BTreeMap<String, Value>,
}

impl RendererOutput {
    /// Verify local id uniqueness within the output set
    ///
    /// A duplicate local id would make reported-property merging and
    /// deferred resolution ambiguous, so it is a render error.
    pub fn validate(&self, resource: &ResourceId) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for output in &self.resources {
            if !seen.insert(output.local_id.as_str()) {
                return Err(Error::render(
                    resource.clone(),
                    format!("duplicate output resource local id '{}'", output.local_id),
                ));
            }
        }
        Ok(())
    }
}

/// Per-resource-type transformation from definition to output resources
///
/// Implementations must be pure with respect to the backend: they build
/// desired-state payloads only.
pub trait Renderer: Send + Sync {
    /// Dependency ids induced by the definition's property values
    ///
    /// These supplement explicit `dependsOn` references when the dependency
    /// graph is built (e.g. a connection naming its source resource).
    fn dependency_ids(&self, definition: &ResourceDefinition) -> Result<Vec<ResourceId>>;

    /// Produce the output resources and computed values for a definition
    ///
    /// `dependencies` holds the fully-resolved outputs of the definition's
    /// declared dependencies; the topological walk guarantees they have
    /// completed apply.
    fn render(
        &self,
        definition: &ResourceDefinition,
        dependencies: &ResolvedOutputs,
    ) -> Result<RendererOutput>;
}

/// Dispatch table from resource type tag to renderer
///
/// Built once at startup; lookup of an unregistered type is a render error
/// naming the type.
#[derive(Clone, Default)]
pub struct RendererRegistry {
    renderers: HashMap<String, Arc<dyn Renderer>>,
}

impl RendererRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in renderers registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(container::RESOURCE_TYPE, Arc::new(ContainerRenderer::new()));
        registry.register(route::RESOURCE_TYPE, Arc::new(RouteRenderer::new()));
        registry
    }

    /// Register a renderer for a resource type tag
    pub fn register(&mut self, resource_type: impl Into<String>, renderer: Arc<dyn Renderer>) {
        self.renderers.insert(resource_type.into(), renderer);
    }

    /// Look up the renderer for a definition
    pub fn renderer_for(&self, definition: &ResourceDefinition) -> Result<&Arc<dyn Renderer>> {
        self.renderers
            .get(&definition.resource_type)
            .ok_or_else(|| {
                Error::render(
                    definition.id.clone(),
                    format!(
                        "no renderer registered for resource type '{}'",
                        definition.resource_type
                    ),
                )
            })
    }

    /// Dependency ids for a definition via its renderer
    pub fn dependency_ids(&self, definition: &ResourceDefinition) -> Result<Vec<ResourceId>> {
        self.renderer_for(definition)?.dependency_ids(definition)
    }

    /// Render a definition via its renderer, validating the output set
    pub fn render(
        &self,
        definition: &ResourceDefinition,
        dependencies: &ResolvedOutputs,
    ) -> Result<RendererOutput> {
        let output = self.renderer_for(definition)?.render(definition, dependencies)?;
        output.validate(&definition.id)?;
        Ok(output)
    }
}
