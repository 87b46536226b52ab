//! Kubernetes resource handler
//!
//! Applies untyped manifests with server-side apply, which is what makes
//! `put` idempotent: repeating the same desired state is a no-op on the
//! server. Before applying, the handler upserts the target namespace. For
//! workload-kind output resources that are not pre-existing, it delegates to
//! the convergence monitor and does not return from `put` until the workload
//! is actually ready (or the session ends otherwise). Delete ignores
//! not-found so it can run again after a prior partial success.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::convergence::{ConvergenceConfig, ConvergenceMonitor, WorkloadRef};
use crate::output::{KubernetesIdentity, OutputResource, ResourceIdentity};
use crate::{Error, Result, FIELD_MANAGER};

use super::{PutResponse, ResourceHandler};

/// Reported property key for the object kind
pub const PROPERTY_KIND: &str = "kind";
/// Reported property key for the object API version
pub const PROPERTY_API_VERSION: &str = "apiVersion";
/// Reported property key for the object namespace
pub const PROPERTY_NAMESPACE: &str = "namespace";
/// Reported property key for the object name
pub const PROPERTY_NAME: &str = "name";

/// Handler for Kubernetes-bound output resources
pub struct KubernetesHandler {
    client: Client,
    monitor: ConvergenceMonitor,
}

impl KubernetesHandler {
    /// Create a handler with explicit convergence configuration
    pub fn new(client: Client, config: ConvergenceConfig) -> Self {
        let monitor = ConvergenceMonitor::new(client.clone(), config);
        Self { client, monitor }
    }

    /// Create a handler with default timeout and resync interval
    pub fn with_defaults(client: Client) -> Self {
        Self::new(client, ConvergenceConfig::default())
    }

    /// Tie convergence sessions to a parent cancellation token
    ///
    /// Cancelling the token ends in-flight sessions with a `Cancelled`
    /// verdict, distinct from a timeout.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.monitor = self.monitor.with_cancellation(token);
        self
    }

    /// Upsert the target namespace so apply never races namespace creation
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": namespace},
        });
        let api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(self.client.clone());
        api.patch(
            namespace,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&manifest),
        )
        .await?;
        debug!(namespace = %namespace, "Namespace upserted");
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for KubernetesHandler {
    async fn put(&self, output: &OutputResource) -> Result<PutResponse> {
        let meta = ManifestMeta::from_payload(&output.payload)?;
        let properties = meta.properties();

        self.ensure_namespace(&meta.namespace).await?;

        if output.deployed {
            // Pre-existing object: apply is a no-op and the engine does not
            // own its lifecycle, so no identity is assigned.
            debug!(
                kind = %meta.kind,
                name = %meta.name,
                namespace = %meta.namespace,
                "Output resource marked deployed, skipping apply"
            );
            return Ok(PutResponse {
                identity: None,
                properties,
            });
        }

        let ar = build_api_resource(&meta.api_version, &meta.kind);
        let obj: DynamicObject = serde_json::from_value(output.payload.clone())
            .map_err(|e| Error::serialization(format!("invalid manifest payload: {e}")))?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &meta.namespace, &ar);
        api.patch(
            &meta.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&obj),
        )
        .await?;

        let identity = ResourceIdentity::kubernetes(&KubernetesIdentity {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            kind: meta.kind.clone(),
            api_version: meta.api_version.clone(),
        })?;

        // Only workloads are monitored; other kinds are ready once applied.
        if meta.kind.eq_ignore_ascii_case("deployment") {
            self.monitor
                .wait_until_ready(&WorkloadRef {
                    namespace: meta.namespace.clone(),
                    name: meta.name.clone(),
                })
                .await?;
            info!(
                name = %meta.name,
                namespace = %meta.namespace,
                "Deployment is ready"
            );
        }

        Ok(PutResponse {
            identity: Some(identity),
            properties,
        })
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        let k8s = identity.as_kubernetes()?;
        let ar = build_api_resource(&k8s.api_version, &k8s.kind);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &k8s.namespace, &ar);

        match api.delete(&k8s.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(
                    kind = %k8s.kind,
                    name = %k8s.name,
                    namespace = %k8s.namespace,
                    "Deleted object"
                );
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(
                    kind = %k8s.kind,
                    name = %k8s.name,
                    namespace = %k8s.namespace,
                    "Object already absent, treating delete as success"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Addressing metadata extracted from a manifest payload
struct ManifestMeta {
    api_version: String,
    kind: String,
    name: String,
    namespace: String,
}

impl ManifestMeta {
    fn from_payload(payload: &Value) -> Result<Self> {
        let api_version = required_str(payload, "apiVersion")?;
        let kind = required_str(payload, "kind")?;
        let name = payload
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::serialization("manifest payload missing metadata.name"))?
            .to_string();
        let namespace = payload
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        Ok(Self {
            api_version,
            kind,
            name,
            namespace,
        })
    }

    /// Flat property map reported to the orchestrator after apply
    fn properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (PROPERTY_KIND.to_string(), self.kind.clone()),
            (PROPERTY_API_VERSION.to_string(), self.api_version.clone()),
            (PROPERTY_NAMESPACE.to_string(), self.namespace.clone()),
            (PROPERTY_NAME.to_string(), self.name.clone()),
        ])
    }
}

fn required_str(payload: &Value, key: &str) -> Result<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::serialization(format!("manifest payload missing {key}")))
}

/// Split an apiVersion like "apps/v1" into group and version
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Simple English pluralization for resource kinds
///
/// Covers the standard kinds this engine applies; unusual CRD plurals would
/// need discovery instead.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Build an `ApiResource` from a known apiVersion and kind
///
/// The version is used exactly as given; this matches applying a parsed
/// manifest, where the author chose the version.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}
