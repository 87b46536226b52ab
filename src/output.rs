//! Output resources produced by rendering
//!
//! An [`OutputResource`] is one backend-bound artifact produced by rendering
//! a resource definition: a local id unique within that resource's output
//! set, a backend provider tag, and an untyped manifest payload. After a
//! successful apply it additionally carries a backend-assigned
//! [`ResourceIdentity`], a handle sufficient to re-locate and delete it.

use serde::{Deserialize, Serialize};

/// Well-known local id for a rendered workload
pub const LOCAL_ID_DEPLOYMENT: &str = "deployment";
/// Well-known local id for a rendered service
pub const LOCAL_ID_SERVICE: &str = "service";

/// Backend provider responsible for an output resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum Provider {
    /// Kubernetes cluster objects
    Kubernetes,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kubernetes => f.write_str("kubernetes"),
        }
    }
}

/// Identity of an applied Kubernetes object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesIdentity {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Object kind
    pub kind: String,
    /// API version the object was applied as
    pub api_version: String,
}

/// Backend-assigned identity of an applied output resource
///
/// The `data` payload is provider-shaped; for Kubernetes it decodes to
/// [`KubernetesIdentity`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    /// The provider that assigned this identity
    pub provider: Provider,
    /// Provider-shaped identity payload
    pub data: serde_json::Value,
}

impl ResourceIdentity {
    /// Build a Kubernetes identity
    pub fn kubernetes(identity: &KubernetesIdentity) -> crate::Result<Self> {
        Ok(Self {
            provider: Provider::Kubernetes,
            data: serde_json::to_value(identity)
                .map_err(|e| crate::Error::serialization(e.to_string()))?,
        })
    }

    /// Decode the identity payload as a Kubernetes identity
    pub fn as_kubernetes(&self) -> crate::Result<KubernetesIdentity> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            crate::Error::serialization(format!("invalid kubernetes identity: {e}"))
        })
    }
}

/// One backend-bound artifact produced by rendering a resource definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResource {
    /// Identifier unique within this resource's output set
    pub local_id: String,
    /// Backend provider responsible for applying this resource
    pub provider: Provider,
    /// Full desired-state manifest (apiVersion/kind/metadata/...)
    pub payload: serde_json::Value,
    /// Already exists in the backend; apply is a no-op
    #[serde(default)]
    pub deployed: bool,
    /// Backend-assigned identity, present after a successful apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ResourceIdentity>,
}

impl OutputResource {
    /// Create a Kubernetes output resource from a manifest payload
    pub fn kubernetes(local_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            local_id: local_id.into(),
            provider: Provider::Kubernetes,
            payload,
            deployed: false,
            identity: None,
        }
    }

    /// Mark this resource as pre-existing (apply becomes a no-op)
    pub fn with_deployed(mut self, deployed: bool) -> Self {
        self.deployed = deployed;
        self
    }
}
