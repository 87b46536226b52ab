//! Resource definitions submitted to a deployment operation
//!
//! A [`ResourceDefinition`] is the declarative input to the engine: an
//! identity, a resource type tag selecting a renderer, a property tree, and
//! explicit references to the resources it depends on. Definitions are
//! immutable once submitted to one deployment operation; further updates go
//! through a new operation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a resource definition
///
/// Opaque to the engine apart from equality and display. Conventionally a
/// scope-qualified path such as `todo-app/frontend`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A declarative resource definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Identity, unique within one deployment operation
    pub id: ResourceId,
    /// Short name used for rendered object names and graph views
    pub name: String,
    /// Resource type tag selecting the renderer (e.g. `core/container`)
    pub resource_type: String,
    /// Declarative property tree consumed by the renderer
    pub properties: serde_json::Value,
    /// Explicit dependency references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ResourceId>,
}

impl ResourceDefinition {
    /// Create a definition with an empty property tree and no dependencies
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: ResourceId::new(id),
            name: name.into(),
            resource_type: resource_type.into(),
            properties: serde_json::Value::Object(serde_json::Map::new()),
            depends_on: Vec::new(),
        }
    }

    /// Set the property tree
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Add an explicit dependency
    pub fn with_dependency(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
