//! Per-workload session state and the central evaluation loop
//!
//! Watch feeds push typed objects into a bounded queue; one loop per session
//! consumes the queue, updates the cached view of the workload and its
//! children, and re-evaluates readiness after every event. The loop never
//! touches the API server, which keeps it fully drivable by tests.

use std::collections::HashMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::status;
use super::WorkloadRef;
use crate::error::ConvergenceFailure;

/// How many watch events a session buffers before feeds block
pub(crate) const EVENT_QUEUE_DEPTH: usize = 256;

/// One object delivered by a watch feed
#[derive(Clone, Debug)]
pub(crate) enum WatchedObject {
    /// The workload being converged on
    Workload(Box<Deployment>),
    /// A replica set in the workload's namespace
    ReplicaSet(Box<ReplicaSet>),
    /// A pod in the workload's namespace
    Pod(Box<Pod>),
}

/// Terminal result of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The rollout completed and every current-generation pod is ready
    Ready,
    /// The session ended without reaching readiness
    Failed(ConvergenceFailure),
}

/// How the evaluation loop ended
#[derive(Debug)]
pub(crate) enum LoopEnd {
    /// A verdict was reached from observed state or cancellation
    Settled(Verdict),
    /// The deadline expired; the caller reports the last observed condition
    DeadlineExpired,
}

/// Cached view of the workload and the objects owned by it
#[derive(Debug)]
pub(crate) struct SessionState {
    target: WorkloadRef,
    workload: Option<Deployment>,
    replica_sets: HashMap<String, ReplicaSet>,
    pods: HashMap<String, Pod>,
}

impl SessionState {
    pub(crate) fn new(target: WorkloadRef) -> Self {
        Self {
            target,
            workload: None,
            replica_sets: HashMap::new(),
            pods: HashMap::new(),
        }
    }

    /// Fold one watch event into the cache
    pub(crate) fn observe(&mut self, object: WatchedObject) {
        match object {
            WatchedObject::Workload(deployment) => {
                if deployment.metadata.name.as_deref() == Some(self.target.name.as_str()) {
                    self.workload = Some(*deployment);
                }
            }
            WatchedObject::ReplicaSet(rs) => {
                if let Some(name) = rs.metadata.name.clone() {
                    self.replica_sets.insert(name, *rs);
                }
            }
            WatchedObject::Pod(pod) => {
                if let Some(name) = pod.metadata.name.clone() {
                    self.pods.insert(name, *pod);
                }
            }
        }
    }

    /// Evaluate the cached state. `None` means no terminal state yet.
    ///
    /// Pod classification runs exactly once per pod per evaluation; the same
    /// result drives both the failure check and the readiness tally.
    pub(crate) fn evaluate(&self) -> Option<Verdict> {
        let workload = self.workload.as_ref()?;
        let current_rs = status::newest_owned_replica_set(workload, self.replica_sets.values())?;

        let mut all_ready = true;
        for pod in self
            .pods
            .values()
            .filter(|pod| status::pod_owned_by(pod, &current_rs))
        {
            match status::check_pod(pod) {
                Err(failure) => {
                    debug!(workload = %self.target, %failure, "pod reached a terminal failure state");
                    return Some(Verdict::Failed(failure));
                }
                Ok(false) => all_ready = false,
                Ok(true) => {}
            }
        }

        // An empty pod set counts as ready; the rollout condition below is
        // what actually gates completion.
        if all_ready && status::workload_progressed(workload) {
            return Some(Verdict::Ready);
        }
        trace!(workload = %self.target, replica_set = %current_rs, "workload not converged yet");
        None
    }

    /// Last observed workload condition, for deadline reporting when a final
    /// API read is not possible
    pub(crate) fn last_condition(&self) -> Option<(String, String)> {
        self.workload.as_ref().map(status::last_condition)
    }
}

/// Consume events until a verdict, cancellation, or the deadline.
///
/// The deadline is handled by returning [`LoopEnd::DeadlineExpired`] rather
/// than a verdict so the caller can perform one final status read and report
/// the last observed condition.
pub(crate) async fn evaluation_loop(
    state: &mut SessionState,
    events: &mut mpsc::Receiver<WatchedObject>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> LoopEnd {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                return LoopEnd::Settled(Verdict::Failed(ConvergenceFailure::Cancelled));
            }
            () = &mut deadline => {
                return LoopEnd::DeadlineExpired;
            }
            event = events.recv() => {
                match event {
                    Some(object) => {
                        state.observe(object);
                        if let Some(verdict) = state.evaluate() {
                            return LoopEnd::Settled(verdict);
                        }
                    }
                    None => {
                        return LoopEnd::Settled(Verdict::Failed(ConvergenceFailure::Correlation {
                            message: "watch feeds closed before the workload converged".to_owned(),
                        }));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> WorkloadRef {
        WorkloadRef {
            namespace: "default".to_owned(),
            name: "web".to_owned(),
        }
    }

    fn ready_workload() -> WatchedObject {
        WatchedObject::Workload(Box::new(
            serde_json::from_value(json!({
                "metadata": {"name": "web", "generation": 1, "uid": "dep-uid"},
                "status": {
                    "observedGeneration": 1,
                    "conditions": [{
                        "type": "Progressing",
                        "status": "True",
                        "reason": "NewReplicaSetAvailable",
                    }],
                },
            }))
            .expect("deployment fixture"),
        ))
    }

    fn current_replica_set() -> WatchedObject {
        WatchedObject::ReplicaSet(Box::new(
            serde_json::from_value(json!({
                "metadata": {
                    "name": "web-1",
                    "ownerReferences": [{
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "name": "web",
                        "uid": "dep-uid",
                        "controller": true,
                    }],
                    "annotations": {"deployment.kubernetes.io/revision": "1"},
                },
            }))
            .expect("replica set fixture"),
        ))
    }

    fn pod(name: &str, status: serde_json::Value) -> WatchedObject {
        WatchedObject::Pod(Box::new(
            serde_json::from_value(json!({
                "metadata": {
                    "name": name,
                    "ownerReferences": [{
                        "apiVersion": "apps/v1",
                        "kind": "ReplicaSet",
                        "name": "web-1",
                        "uid": "rs-uid",
                        "controller": true,
                    }],
                },
                "status": status,
            }))
            .expect("pod fixture"),
        ))
    }

    fn ready_pod_status() -> serde_json::Value {
        json!({
            "conditions": [
                {"type": "Ready", "status": "True"},
                {"type": "ContainersReady", "status": "True"},
            ],
            "containerStatuses": [{
                "name": "app",
                "ready": true,
                "restartCount": 0,
                "image": "img",
                "imageID": "",
                "state": {"running": {"startedAt": "2024-01-01T00:00:00Z"}},
            }],
        })
    }

    fn crashing_pod_status() -> serde_json::Value {
        json!({
            "containerStatuses": [{
                "name": "app",
                "ready": false,
                "restartCount": 4,
                "image": "img",
                "imageID": "",
                "state": {"waiting": {"reason": "CrashLoopBackOff", "message": "back-off"}},
            }],
        })
    }

    #[test]
    fn no_verdict_before_the_workload_is_observed() {
        let mut state = SessionState::new(target());
        state.observe(pod("web-1-a", ready_pod_status()));
        assert_eq!(state.evaluate(), None);
    }

    #[test]
    fn empty_pod_set_converges_on_rollout_completion() {
        let mut state = SessionState::new(target());
        state.observe(ready_workload());
        state.observe(current_replica_set());
        assert_eq!(state.evaluate(), Some(Verdict::Ready));
    }

    #[test]
    fn all_pods_ready_yields_ready() {
        let mut state = SessionState::new(target());
        state.observe(ready_workload());
        state.observe(current_replica_set());
        state.observe(pod("web-1-a", ready_pod_status()));
        state.observe(pod("web-1-b", ready_pod_status()));
        assert_eq!(state.evaluate(), Some(Verdict::Ready));
    }

    #[test]
    fn crashing_pod_fails_the_session() {
        let mut state = SessionState::new(target());
        state.observe(ready_workload());
        state.observe(current_replica_set());
        state.observe(pod("web-1-a", ready_pod_status()));
        state.observe(pod("web-1-b", crashing_pod_status()));
        match state.evaluate() {
            Some(Verdict::Failed(ConvergenceFailure::ContainerFailure { reason, .. })) => {
                assert_eq!(reason, "CrashLoopBackOff");
            }
            other => panic!("expected container failure, got {other:?}"),
        }
    }

    #[test]
    fn pods_of_an_older_replica_set_are_ignored() {
        let mut state = SessionState::new(target());
        state.observe(ready_workload());
        state.observe(current_replica_set());
        // Crashing pod belongs to a replica set that is not the newest one.
        state.observe(WatchedObject::Pod(Box::new(
            serde_json::from_value(json!({
                "metadata": {
                    "name": "web-0-z",
                    "ownerReferences": [{
                        "apiVersion": "apps/v1",
                        "kind": "ReplicaSet",
                        "name": "web-0",
                        "uid": "old-rs-uid",
                        "controller": true,
                    }],
                },
                "status": crashing_pod_status(),
            }))
            .expect("pod fixture"),
        )));
        assert_eq!(state.evaluate(), Some(Verdict::Ready));
    }

    #[test]
    fn events_for_other_workloads_are_ignored() {
        let mut state = SessionState::new(target());
        state.observe(WatchedObject::Workload(Box::new(
            serde_json::from_value(json!({
                "metadata": {"name": "other", "generation": 1},
                "status": {"observedGeneration": 1},
            }))
            .expect("deployment fixture"),
        )));
        assert_eq!(state.evaluate(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_settles_ready_once_events_arrive() {
        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut state = SessionState::new(target());
        let cancel = CancellationToken::new();

        tx.send(ready_workload()).await.expect("send");
        tx.send(current_replica_set()).await.expect("send");
        tx.send(pod("web-1-a", ready_pod_status())).await.expect("send");

        let end = evaluation_loop(&mut state, &mut rx, &cancel, Duration::from_secs(600)).await;
        match end {
            LoopEnd::Settled(Verdict::Ready) => {}
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_reports_deadline_expiry() {
        let (_tx, mut rx) = mpsc::channel::<WatchedObject>(EVENT_QUEUE_DEPTH);
        let mut state = SessionState::new(target());
        let cancel = CancellationToken::new();

        let end = evaluation_loop(&mut state, &mut rx, &cancel, Duration::from_secs(1)).await;
        assert!(matches!(end, LoopEnd::DeadlineExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_beats_the_deadline() {
        let (_tx, mut rx) = mpsc::channel::<WatchedObject>(EVENT_QUEUE_DEPTH);
        let mut state = SessionState::new(target());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let end = evaluation_loop(&mut state, &mut rx, &cancel, Duration::from_secs(600)).await;
        match end {
            LoopEnd::Settled(Verdict::Failed(ConvergenceFailure::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_feeds_fail_the_session() {
        let (tx, mut rx) = mpsc::channel::<WatchedObject>(EVENT_QUEUE_DEPTH);
        drop(tx);
        let mut state = SessionState::new(target());
        let cancel = CancellationToken::new();

        let end = evaluation_loop(&mut state, &mut rx, &cancel, Duration::from_secs(600)).await;
        match end {
            LoopEnd::Settled(Verdict::Failed(ConvergenceFailure::Correlation { .. })) => {}
            other => panic!("expected correlation failure, got {other:?}"),
        }
    }
}
