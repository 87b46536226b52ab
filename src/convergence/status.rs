//! Pure readiness and failure predicates over cached Kubernetes objects
//!
//! Everything in this module is synchronous and side-effect free so the
//! evaluation loop can be driven entirely by synthetic objects in tests.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;

use crate::error::ConvergenceFailure;

/// Annotation carrying the rollout revision a replica set belongs to
const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Condition reason the rollout controller sets once the newest replica set
/// has fully replaced the old one
const NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";

/// Waiting reasons that will never resolve without operator intervention
const FATAL_WAITING_REASONS: &[&str] = &["ErrImagePull", "ImagePullBackOff", "CrashLoopBackOff"];

/// Whether the workload's own status reports a completed rollout.
///
/// Requires the `Progressing` condition to be `True` with the terminal
/// reason (matched case-insensitively, some controllers vary the casing) and
/// the controller to have observed the generation being waited on.
pub(crate) fn workload_progressed(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let progressed = status
        .conditions
        .iter()
        .flatten()
        .any(|condition| {
            condition.type_ == "Progressing"
                && condition.status == "True"
                && condition
                    .reason
                    .as_deref()
                    .is_some_and(|reason| reason.eq_ignore_ascii_case(NEW_REPLICA_SET_AVAILABLE))
        });
    let observed = match (status.observed_generation, deployment.metadata.generation) {
        (Some(observed), Some(generation)) => observed >= generation,
        // No generation recorded yet means the controller has not caught up.
        _ => false,
    };
    progressed && observed
}

/// Name of the newest replica set controlled by this deployment, by numeric
/// revision annotation. Replica sets without a parseable revision are
/// ignored rather than treated as newest.
pub(crate) fn newest_owned_replica_set<'a>(
    deployment: &Deployment,
    replica_sets: impl Iterator<Item = &'a ReplicaSet>,
) -> Option<String> {
    let mut newest: Option<(i64, String)> = None;
    for rs in replica_sets {
        if !controlled_by_deployment(rs, deployment) {
            continue;
        }
        let Some(revision) = rs
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(REVISION_ANNOTATION))
            .and_then(|raw| raw.parse::<i64>().ok())
        else {
            continue;
        };
        let Some(name) = rs.metadata.name.clone() else {
            continue;
        };
        match &newest {
            Some((best, _)) if *best >= revision => {}
            _ => newest = Some((revision, name)),
        }
    }
    newest.map(|(_, name)| name)
}

fn controlled_by_deployment(rs: &ReplicaSet, deployment: &Deployment) -> bool {
    let Some(deployment_name) = deployment.metadata.name.as_deref() else {
        return false;
    };
    rs.metadata.owner_references.iter().flatten().any(|owner| {
        owner.controller == Some(true)
            && owner.kind == "Deployment"
            && owner.name == deployment_name
            && match deployment.metadata.uid.as_deref() {
                // Uid match guards against a deleted-and-recreated owner of
                // the same name; skip it when the cached owner has no uid.
                Some(uid) if !uid.is_empty() => owner.uid == uid,
                _ => true,
            }
    })
}

/// Whether `pod` is controlled by the replica set named `rs_name`
pub(crate) fn pod_owned_by(pod: &Pod, rs_name: &str) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.kind == "ReplicaSet" && owner.name == rs_name)
}

/// Classify one pod: `Ok(true)` when fully ready, `Ok(false)` when still
/// making progress, `Err` when it has reached a state that will not resolve
/// on its own.
pub(crate) fn check_pod(pod: &Pod) -> Result<bool, ConvergenceFailure> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let Some(status) = pod.status.as_ref() else {
        return Ok(false);
    };

    let mut conditions_ready = true;
    for condition in status.conditions.iter().flatten() {
        if condition.type_ == "PodScheduled" && condition.status == "False" {
            return Err(ConvergenceFailure::PodNotScheduled {
                pod: pod_name,
                reason: condition.reason.clone().unwrap_or_default(),
                message: condition.message.clone().unwrap_or_default(),
            });
        }
        if (condition.type_ == "Ready" || condition.type_ == "ContainersReady")
            && condition.status != "True"
        {
            conditions_ready = false;
        }
    }

    let Some(container_statuses) = status.container_statuses.as_ref() else {
        return Ok(false);
    };
    if container_statuses.is_empty() {
        return Ok(false);
    }

    for cs in container_statuses {
        let Some(state) = cs.state.as_ref() else {
            return Ok(false);
        };
        if let Some(terminated) = state.terminated.as_ref() {
            return Err(ConvergenceFailure::ContainerFailure {
                pod: pod_name,
                state: "Terminated".to_owned(),
                reason: terminated.reason.clone().unwrap_or_default(),
                message: terminated.message.clone().unwrap_or_default(),
            });
        } else if let Some(waiting) = state.waiting.as_ref() {
            let reason = waiting.reason.clone().unwrap_or_default();
            if FATAL_WAITING_REASONS.contains(&reason.as_str()) {
                let mut message = waiting.message.clone().unwrap_or_default();
                if let Some(last) = cs
                    .last_state
                    .as_ref()
                    .and_then(|last| last.terminated.as_ref())
                    .and_then(|terminated| terminated.message.as_deref())
                {
                    message = format!("{message} LastTerminationState: {last}");
                }
                return Err(ConvergenceFailure::ContainerFailure {
                    pod: pod_name,
                    state: "Waiting".to_owned(),
                    reason,
                    message,
                });
            }
        } else if state.running.is_none() {
            return Ok(false);
        } else if !cs.ready {
            return Ok(false);
        }
    }

    Ok(conditions_ready)
}

/// Reason and message of the most recent workload condition, for reporting
/// what was last observed when a deadline expires. Never returns empty
/// strings.
pub(crate) fn last_condition(deployment: &Deployment) -> (String, String) {
    let condition = deployment
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.last());
    match condition {
        Some(condition) => (
            condition
                .reason
                .clone()
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| "Unknown".to_owned()),
            condition
                .message
                .clone()
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| "no condition message reported".to_owned()),
        ),
        None => (
            "Unknown".to_owned(),
            "workload reported no conditions".to_owned(),
        ),
    }
}
