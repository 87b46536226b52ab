//! Route renderer
//!
//! Renders a `core/route` definition into a ClusterIP Service fronting the
//! containers that carry the route's selector label, and publishes the
//! route's address as computed values: `host`, `port`, `scheme`, and `url`
//! are fixed at render time; `namespace` is deferred to the applied
//! Service's reported properties.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::definition::{ResourceDefinition, ResourceId};
use crate::output::{OutputResource, LOCAL_ID_SERVICE};
use crate::values::{ComputedValueReference, ResolvedOutputs};
use crate::Result;

use super::container::namespace_of;
use super::{Renderer, RendererOutput};

/// Resource type tag handled by this renderer
pub const RESOURCE_TYPE: &str = "core/route";

/// Label carried by workloads that provide a route
pub const ROUTE_LABEL: &str = "strata.io/route";

const DEFAULT_PORT: u16 = 80;

/// Renderer for route definitions
#[derive(Debug, Default)]
pub struct RouteRenderer;

impl RouteRenderer {
    /// Create the renderer
    pub fn new() -> Self {
        Self
    }
}

impl Renderer for RouteRenderer {
    fn dependency_ids(&self, _definition: &ResourceDefinition) -> Result<Vec<ResourceId>> {
        // Routes are provided by containers, not the other way around; the
        // container side declares the connection.
        Ok(Vec::new())
    }

    fn render(
        &self,
        definition: &ResourceDefinition,
        _dependencies: &ResolvedOutputs,
    ) -> Result<RendererOutput> {
        let namespace = namespace_of(definition);
        let port = effective_port(definition);
        let host = definition.name.clone();

        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": definition.name,
                "namespace": namespace,
                "labels": super::container::standard_labels(&definition.name),
            },
            "spec": {
                "type": "ClusterIP",
                "selector": {ROUTE_LABEL: definition.name},
                "ports": [{"port": port, "targetPort": port, "protocol": "TCP"}],
            },
        });

        let computed_values = BTreeMap::from([
            (
                "host".to_string(),
                ComputedValueReference::literal(host.clone()),
            ),
            ("port".to_string(), ComputedValueReference::literal(port)),
            (
                "scheme".to_string(),
                ComputedValueReference::literal("http"),
            ),
            (
                "url".to_string(),
                ComputedValueReference::literal(format!("http://{host}:{port}")),
            ),
            (
                "namespace".to_string(),
                ComputedValueReference::deferred(LOCAL_ID_SERVICE, "namespace"),
            ),
        ]);

        Ok(RendererOutput {
            resources: vec![OutputResource::kubernetes(LOCAL_ID_SERVICE, service)],
            computed_values,
            secret_values: BTreeMap::new(),
        })
    }
}

fn effective_port(definition: &ResourceDefinition) -> u16 {
    definition
        .properties
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(DEFAULT_PORT)
}
