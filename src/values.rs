//! Computed value references and property resolution
//!
//! A renderer names the output values of its resource as
//! [`ComputedValueReference`]s. A value is either a literal fixed at render
//! time, or deferred: a selector over the properties the backend reports for
//! one of the resource's own output resources, resolvable only after that
//! output's apply returns. Resolution is lazy and a missing path is terminal
//! for the whole operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::ResourceId;
use crate::{Error, Result};

/// A named output value of a resource
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ComputedValueReference {
    /// A value known at render time
    Literal {
        /// The value
        value: Value,
    },
    /// A value read from backend-reported properties after apply
    Deferred {
        /// Local id of the output resource whose properties hold the value
        local_id: String,
        /// Dot-separated path into the reported properties
        path: String,
    },
}

impl ComputedValueReference {
    /// A literal value
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    /// A deferred lookup against an output resource's reported properties
    pub fn deferred(local_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Deferred {
            local_id: local_id.into(),
            path: path.into(),
        }
    }
}

/// Look up a dot-separated path in a JSON value
///
/// Returns `None` when any segment is absent or a non-object is traversed.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Resolved output values of already-applied resources, keyed by resource id
///
/// This is the renderer's view of its dependencies: for each declared
/// dependency, the computed values its deployment resolved.
#[derive(Clone, Debug, Default)]
pub struct ResolvedOutputs {
    outputs: BTreeMap<ResourceId, BTreeMap<String, Value>>,
}

impl ResolvedOutputs {
    /// Create an empty output set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the resolved values of one resource
    pub fn insert(&mut self, id: ResourceId, values: BTreeMap<String, Value>) {
        self.outputs.insert(id, values);
    }

    /// All resolved values of one resource, if it has completed apply
    pub fn values_of(&self, id: &ResourceId) -> Option<&BTreeMap<String, Value>> {
        self.outputs.get(id)
    }

    /// One resolved value of a dependency
    ///
    /// Fails with [`Error::UnresolvedReference`] when the dependency has not
    /// completed apply or the named value is absent.
    pub fn value(&self, id: &ResourceId, name: &str) -> Result<&Value> {
        self.outputs
            .get(id)
            .and_then(|values| values.get(name))
            .ok_or_else(|| Error::UnresolvedReference {
                resource: id.clone(),
                path: name.to_string(),
                message: format!("dependency {id} has no resolved value '{name}'"),
            })
    }

    /// One resolved value of a dependency as a string
    pub fn string_value(&self, id: &ResourceId, name: &str) -> Result<String> {
        let value = self.value(id, name)?;
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        }
    }
}

/// Resolve one resource's computed value references after its outputs applied
///
/// `reported` maps each output resource's local id to the properties its
/// handler returned from Put. Literals pass through; deferred selectors are
/// evaluated against the reported properties, and a missing local id or path
/// is an [`Error::UnresolvedReference`] naming the resource and path.
pub fn resolve_computed_values(
    resource: &ResourceId,
    references: &BTreeMap<String, ComputedValueReference>,
    reported: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    let mut resolved = BTreeMap::new();
    for (name, reference) in references {
        let value = match reference {
            ComputedValueReference::Literal { value } => value.clone(),
            ComputedValueReference::Deferred { local_id, path } => {
                let properties =
                    reported
                        .get(local_id)
                        .ok_or_else(|| Error::UnresolvedReference {
                            resource: resource.clone(),
                            path: path.clone(),
                            message: format!(
                                "no reported properties for output resource '{local_id}'"
                            ),
                        })?;
                lookup_path(properties, path)
                    .ok_or_else(|| Error::UnresolvedReference {
                        resource: resource.clone(),
                        path: path.clone(),
                        message: format!(
                            "path absent in reported properties of '{local_id}' \
                             while resolving computed value '{name}'"
                        ),
                    })?
                    .clone()
            }
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Convert a flat string property map into a JSON object value
pub fn properties_to_value(properties: &BTreeMap<String, String>) -> Value {
    Value::Object(
        properties
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_path_walks_nested_objects() {
        let value = json!({"status": {"addresses": {"host": "svc-a"}}});
        assert_eq!(
            lookup_path(&value, "status.addresses.host"),
            Some(&json!("svc-a"))
        );
        assert_eq!(lookup_path(&value, "status.missing"), None);
        assert_eq!(lookup_path(&value, "status.addresses.host.deeper"), None);
    }

    #[test]
    fn literals_resolve_without_reported_properties() {
        let id = ResourceId::new("app/route");
        let references = BTreeMap::from([(
            "host".to_string(),
            ComputedValueReference::literal("svc-a"),
        )]);

        let resolved =
            resolve_computed_values(&id, &references, &BTreeMap::new()).expect("resolve");
        assert_eq!(resolved.get("host"), Some(&json!("svc-a")));
    }

    #[test]
    fn deferred_reference_reads_reported_properties() {
        let id = ResourceId::new("app/route");
        let references = BTreeMap::from([(
            "namespace".to_string(),
            ComputedValueReference::deferred("service", "namespace"),
        )]);
        let reported = BTreeMap::from([(
            "service".to_string(),
            json!({"namespace": "todo-app", "name": "route-a"}),
        )]);

        let resolved = resolve_computed_values(&id, &references, &reported).expect("resolve");
        assert_eq!(resolved.get("namespace"), Some(&json!("todo-app")));
    }

    #[test]
    fn missing_path_is_a_terminal_unresolved_reference() {
        let id = ResourceId::new("app/route");
        let references = BTreeMap::from([(
            "address".to_string(),
            ComputedValueReference::deferred("service", "status.loadBalancer.ip"),
        )]);
        let reported = BTreeMap::from([("service".to_string(), json!({"name": "route-a"}))]);

        let err = resolve_computed_values(&id, &references, &reported).unwrap_err();
        match err {
            Error::UnresolvedReference { resource, path, .. } => {
                assert_eq!(resource, id);
                assert_eq!(path, "status.loadBalancer.ip");
            }
            other => panic!("expected UnresolvedReference, got {other}"),
        }
    }

    #[test]
    fn missing_local_id_is_a_terminal_unresolved_reference() {
        let id = ResourceId::new("app/route");
        let references = BTreeMap::from([(
            "host".to_string(),
            ComputedValueReference::deferred("gateway", "name"),
        )]);

        let err = resolve_computed_values(&id, &references, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { .. }));
    }

    #[test]
    fn resolved_outputs_surface_dependency_values() {
        let mut outputs = ResolvedOutputs::new();
        outputs.insert(
            ResourceId::new("app/db"),
            BTreeMap::from([("host".to_string(), json!("svc-a"))]),
        );

        assert_eq!(
            outputs
                .string_value(&ResourceId::new("app/db"), "host")
                .expect("resolved"),
            "svc-a"
        );
        assert!(outputs
            .value(&ResourceId::new("app/db"), "port")
            .is_err());
        assert!(outputs
            .value(&ResourceId::new("app/cache"), "host")
            .is_err());
    }
}
