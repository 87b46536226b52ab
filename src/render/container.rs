//! Container renderer
//!
//! Renders a `core/container` definition into a Deployment plus, when ports
//! are declared, a ClusterIP Service. Connections to other resources induce
//! dependency edges and are surfaced to the workload as `CONNECTION_*`
//! environment variables built from the dependency's resolved outputs.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::definition::{ResourceDefinition, ResourceId};
use crate::output::{OutputResource, LOCAL_ID_DEPLOYMENT, LOCAL_ID_SERVICE};
use crate::values::ResolvedOutputs;
use crate::{Error, Result};

use super::{Renderer, RendererOutput};

/// Resource type tag handled by this renderer
pub const RESOURCE_TYPE: &str = "core/container";

/// Renderer for container definitions
#[derive(Debug, Default)]
pub struct ContainerRenderer;

impl ContainerRenderer {
    /// Create the renderer
    pub fn new() -> Self {
        Self
    }
}

impl Renderer for ContainerRenderer {
    fn dependency_ids(&self, definition: &ResourceDefinition) -> Result<Vec<ResourceId>> {
        let mut ids = Vec::new();
        for (name, connection) in connections(definition) {
            let source = connection
                .get("source")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::render_field(
                        definition.id.clone(),
                        format!("properties.connections.{name}.source"),
                        "connection source must be a resource id string",
                    )
                })?;
            ids.push(ResourceId::new(source));
        }
        Ok(ids)
    }

    fn render(
        &self,
        definition: &ResourceDefinition,
        dependencies: &ResolvedOutputs,
    ) -> Result<RendererOutput> {
        let container = definition.properties.get("container").ok_or_else(|| {
            Error::render_field(
                definition.id.clone(),
                "properties.container",
                "container is required",
            )
        })?;
        let image = container
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::render_field(
                    definition.id.clone(),
                    "properties.container.image",
                    "image is required",
                )
            })?;

        let namespace = namespace_of(definition);
        let replicas = definition
            .properties
            .get("replicas")
            .and_then(Value::as_u64)
            .unwrap_or(1);

        let mut env = declared_env(container);
        env.extend(connection_env(definition, dependencies)?);
        let env_list: Vec<Value> = env
            .into_iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();

        let ports = declared_ports(definition, container)?;
        let labels = standard_labels(&definition.name);

        let mut container_spec = Map::new();
        container_spec.insert("name".to_string(), json!(definition.name));
        container_spec.insert("image".to_string(), json!(image));
        if !env_list.is_empty() {
            container_spec.insert("env".to_string(), Value::Array(env_list));
        }
        if !ports.is_empty() {
            let container_ports: Vec<Value> = ports
                .iter()
                .map(|(name, port)| json!({"name": name, "containerPort": port}))
                .collect();
            container_spec.insert("ports".to_string(), Value::Array(container_ports));
        }

        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": definition.name,
                "namespace": namespace,
                "labels": labels,
            },
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": labels},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {"containers": [Value::Object(container_spec)]},
                },
            },
        });

        let mut resources = vec![OutputResource::kubernetes(LOCAL_ID_DEPLOYMENT, deployment)];

        if !ports.is_empty() {
            let service_ports: Vec<Value> = ports
                .iter()
                .map(|(name, port)| json!({"name": name, "port": port, "targetPort": port}))
                .collect();
            let service = json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {
                    "name": definition.name,
                    "namespace": namespace,
                    "labels": labels,
                },
                "spec": {
                    "type": "ClusterIP",
                    "selector": labels,
                    "ports": service_ports,
                },
            });
            resources.push(OutputResource::kubernetes(LOCAL_ID_SERVICE, service));
        }

        Ok(RendererOutput {
            resources,
            computed_values: BTreeMap::new(),
            secret_values: BTreeMap::new(),
        })
    }
}

/// Namespace for rendered objects, defaulting to `default`
pub(crate) fn namespace_of(definition: &ResourceDefinition) -> String {
    definition
        .properties
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string()
}

pub(crate) fn standard_labels(name: &str) -> Value {
    json!({
        "app.kubernetes.io/name": name,
        "app.kubernetes.io/managed-by": "strata",
    })
}

fn connections(definition: &ResourceDefinition) -> Vec<(String, &Value)> {
    definition
        .properties
        .get("connections")
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v)).collect())
        .unwrap_or_default()
}

fn declared_env(container: &Value) -> BTreeMap<String, String> {
    container
        .get("env")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `CONNECTION_<NAME>_<KEY>` variables from each connection's resolved outputs
fn connection_env(
    definition: &ResourceDefinition,
    dependencies: &ResolvedOutputs,
) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for (name, connection) in connections(definition) {
        let Some(source) = connection.get("source").and_then(Value::as_str) else {
            continue; // rejected earlier by dependency_ids
        };
        let source_id = ResourceId::new(source);
        let Some(values) = dependencies.values_of(&source_id) else {
            return Err(Error::UnresolvedReference {
                resource: definition.id.clone(),
                path: source.to_string(),
                message: format!("connection '{name}' source has not completed apply"),
            });
        };
        for (key, value) in values {
            let variable = format!(
                "CONNECTION_{}_{}",
                name.to_uppercase(),
                key.to_uppercase()
            );
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.insert(variable, value);
        }
    }
    Ok(env)
}

fn declared_ports(
    definition: &ResourceDefinition,
    container: &Value,
) -> Result<Vec<(String, u16)>> {
    let mut ports = Vec::new();
    if let Some(map) = container.get("ports").and_then(Value::as_object) {
        for (name, port) in map {
            let number = port
                .get("containerPort")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    Error::render_field(
                        definition.id.clone(),
                        format!("properties.container.ports.{name}.containerPort"),
                        "containerPort must be a valid port number",
                    )
                })?;
            ports.push((name.clone(), number));
        }
    }
    Ok(ports)
}
