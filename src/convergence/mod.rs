//! Convergence monitoring for applied workloads
//!
//! After a workload manifest is applied, the engine watches the workload,
//! its replica sets, and its pods until the rollout either completes, fails
//! terminally, is cancelled, or runs out of time. Three watch feeds push
//! typed objects into one bounded queue per session; a single evaluation
//! loop consumes the queue so all readiness logic runs on one task.
//!
//! Sessions are deduplicated per workload identity: a second `put` for the
//! same namespace/name while a session is in flight awaits the existing
//! session's outcome instead of starting a competing one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConvergenceFailure;
use crate::{Error, Result, DEFAULT_CONVERGENCE_TIMEOUT, DEFAULT_RESYNC_INTERVAL};

mod outcome;
mod session;
mod status;

use outcome::Outcome;
use session::{evaluation_loop, LoopEnd, SessionState, Verdict, WatchedObject, EVENT_QUEUE_DEPTH};

/// Delay before resuming a watch feed after a stream error
const FEED_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Tuning for convergence sessions
#[derive(Clone, Debug)]
pub struct ConvergenceConfig {
    /// How long a session may run before it is reported as timed out
    pub timeout: Duration,
    /// How often watch requests are re-established to pick up missed state
    pub resync_interval: Duration,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONVERGENCE_TIMEOUT,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

/// Identity of a workload being converged on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    /// Namespace the workload lives in
    pub namespace: String,
    /// The workload's object name
    pub name: String,
}

impl WorkloadRef {
    fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Watches applied workloads until they converge
///
/// Cloning is cheap and clones share the session registry, so one monitor
/// can serve every handler in a process.
#[derive(Clone)]
pub struct ConvergenceMonitor {
    client: Client,
    config: ConvergenceConfig,
    cancel: CancellationToken,
    sessions: Arc<DashMap<String, Outcome>>,
}

impl ConvergenceMonitor {
    /// Create a monitor over the given client
    pub fn new(client: Client, config: ConvergenceConfig) -> Self {
        Self {
            client,
            config,
            cancel: CancellationToken::new(),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Tie every session to `token`: cancelling it ends in-flight sessions
    /// with a cancellation failure rather than a timeout
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Block until `workload` converges
    ///
    /// Returns `Ok(())` once the rollout has completed and every
    /// current-generation pod is ready. Any terminal failure, cancellation,
    /// or deadline expiry surfaces as [`Error::Convergence`].
    pub async fn wait_until_ready(&self, workload: &WorkloadRef) -> Result<()> {
        let key = workload.key();
        let (outcome, drives) = join_or_register(&self.sessions, &key);

        let verdict = if drives {
            // The guard deregisters the session on every exit path,
            // including this future being dropped mid-flight.
            let _guard = SessionGuard {
                sessions: Arc::clone(&self.sessions),
                key: key.clone(),
                outcome: outcome.clone(),
            };
            let verdict = self.run_session(workload).await;
            outcome.complete(verdict.clone());
            verdict
        } else {
            debug!(%workload, "joining in-flight convergence session");
            outcome.wait().await
        };

        match verdict {
            Verdict::Ready => Ok(()),
            Verdict::Failed(failure) => Err(Error::Convergence {
                workload: key,
                failure,
            }),
        }
    }

    async fn run_session(&self, workload: &WorkloadRef) -> Verdict {
        info!(%workload, timeout = ?self.config.timeout, "watching workload convergence");

        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let _feeds = FeedGuard::spawn(
            self.client.clone(),
            workload,
            self.config.resync_interval,
            tx,
        );

        let mut state = SessionState::new(workload.clone());
        match evaluation_loop(&mut state, &mut rx, &self.cancel, self.config.timeout).await {
            LoopEnd::Settled(verdict) => {
                info!(%workload, ?verdict, "convergence session settled");
                verdict
            }
            LoopEnd::DeadlineExpired => {
                warn!(%workload, "convergence deadline expired, reading final status");
                self.timeout_verdict(workload, &state).await
            }
        }
    }

    /// One final synchronous read so the timeout names the last observed
    /// workload condition rather than an empty deadline message
    async fn timeout_verdict(&self, workload: &WorkloadRef, state: &SessionState) -> Verdict {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &workload.namespace);
        let (reason, message) = match api.get(&workload.name).await {
            Ok(deployment) => status::last_condition(&deployment),
            Err(err) => match state.last_condition() {
                Some((reason, message)) => (
                    reason,
                    format!("{message} (final status read failed: {err})"),
                ),
                None => (
                    "Unknown".to_owned(),
                    format!("failed to read final workload status: {err}"),
                ),
            },
        };
        Verdict::Failed(ConvergenceFailure::Timeout { reason, message })
    }
}

/// Join the live session registered under `key`, or register a new one.
///
/// Returns the shared outcome and whether this caller drives the session.
/// The entry API makes register-or-join atomic, so two concurrent callers
/// for the same workload can never both come back as drivers.
fn join_or_register(sessions: &DashMap<String, Outcome>, key: &str) -> (Outcome, bool) {
    match sessions.entry(key.to_owned()) {
        dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            let outcome = Outcome::new();
            entry.insert(outcome.clone());
            (outcome, true)
        }
    }
}

/// Removes the registry entry and completes stragglers when a driver exits
struct SessionGuard {
    sessions: Arc<DashMap<String, Outcome>>,
    key: String,
    outcome: Outcome,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Completing first wakes joiners even when the driver was dropped
        // before writing a verdict.
        self.outcome
            .complete(Verdict::Failed(ConvergenceFailure::Cancelled));
        self.sessions.remove(&self.key);
    }
}

/// Aborts the three watch feed tasks when the session ends
struct FeedGuard {
    handles: Vec<JoinHandle<()>>,
}

impl FeedGuard {
    fn spawn(
        client: Client,
        workload: &WorkloadRef,
        resync_interval: Duration,
        tx: mpsc::Sender<WatchedObject>,
    ) -> Self {
        let resync_secs = u32::try_from(resync_interval.as_secs()).unwrap_or(u32::MAX);
        let base_config = watcher::Config::default().timeout(resync_secs);

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &workload.namespace);
        let deployment_config = base_config
            .clone()
            .fields(&format!("metadata.name={}", workload.name));
        let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), &workload.namespace);
        let pods: Api<Pod> = Api::namespaced(client, &workload.namespace);

        let handles = vec![
            tokio::spawn(forward_events(
                kube::runtime::watcher(deployments, deployment_config),
                tx.clone(),
                |deployment| WatchedObject::Workload(Box::new(deployment)),
            )),
            tokio::spawn(forward_events(
                kube::runtime::watcher(replica_sets, base_config.clone()),
                tx.clone(),
                |rs| WatchedObject::ReplicaSet(Box::new(rs)),
            )),
            tokio::spawn(forward_events(
                kube::runtime::watcher(pods, base_config),
                tx,
                |pod| WatchedObject::Pod(Box::new(pod)),
            )),
        ];
        Self { handles }
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Forward list and watch results into the session queue.
///
/// Initial list results flow through the same path as live updates, so the
/// session starts from a complete view without a separate sync phase. Stream
/// errors are logged and retried; the watcher resumes on its own.
async fn forward_events<K, S>(
    stream: S,
    tx: mpsc::Sender<WatchedObject>,
    map: fn(K) -> WatchedObject,
) where
    S: Stream<Item = std::result::Result<Event<K>, watcher::Error>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(object) | Event::InitApply(object)) => {
                if tx.send(map(object)).await.is_err() {
                    // Session ended; nothing left to deliver to.
                    return;
                }
            }
            Ok(Event::Delete(_) | Event::Init | Event::InitDone) => {}
            Err(err) => {
                warn!(error = %err, "watch feed error, retrying");
                tokio::time::sleep(FEED_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_ref_displays_namespace_and_name() {
        let workload = WorkloadRef {
            namespace: "prod".to_owned(),
            name: "web".to_owned(),
        };
        assert_eq!(workload.to_string(), "prod/web");
        assert_eq!(workload.key(), "prod/web");
    }

    #[test]
    fn default_config_uses_engine_defaults() {
        let config = ConvergenceConfig::default();
        assert_eq!(config.timeout, DEFAULT_CONVERGENCE_TIMEOUT);
        assert_eq!(config.resync_interval, DEFAULT_RESYNC_INTERVAL);
    }

    #[test]
    fn second_caller_joins_the_live_session() {
        let sessions: Arc<DashMap<String, Outcome>> = Arc::new(DashMap::new());

        let (driver_outcome, drives) = join_or_register(&sessions, "ns/web");
        assert!(drives);
        let (joiner_outcome, drives) = join_or_register(&sessions, "ns/web");
        assert!(!drives);
        assert_eq!(sessions.len(), 1);

        // Same underlying cell: the driver's verdict is what the joiner sees.
        driver_outcome.complete(Verdict::Ready);
        assert_eq!(joiner_outcome.peek(), Some(Verdict::Ready));
    }

    #[test]
    fn sessions_for_distinct_workloads_do_not_join() {
        let sessions: Arc<DashMap<String, Outcome>> = Arc::new(DashMap::new());
        let (_, drives) = join_or_register(&sessions, "ns/web");
        assert!(drives);
        let (_, drives) = join_or_register(&sessions, "ns/api");
        assert!(drives);
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_joiner_observes_the_drivers_verdict() {
        let sessions: Arc<DashMap<String, Outcome>> = Arc::new(DashMap::new());

        let (driver_outcome, drives) = join_or_register(&sessions, "ns/web");
        assert!(drives);

        let joiner_sessions = Arc::clone(&sessions);
        let joiner = tokio::spawn(async move {
            let (outcome, drives) = join_or_register(&joiner_sessions, "ns/web");
            assert!(!drives);
            outcome.wait().await
        });
        tokio::task::yield_now().await;

        // Driver settles and deregisters, as wait_until_ready does.
        let guard = SessionGuard {
            sessions: Arc::clone(&sessions),
            key: "ns/web".to_owned(),
            outcome: driver_outcome.clone(),
        };
        driver_outcome.complete(Verdict::Ready);
        drop(guard);

        assert_eq!(joiner.await.expect("join"), Verdict::Ready);
        // The identity is free again: the next caller drives a new session.
        let (fresh, drives) = join_or_register(&sessions, "ns/web");
        assert!(drives);
        assert_eq!(fresh.peek(), None);
    }

    #[test]
    fn dropped_session_guard_cancels_and_deregisters() {
        let sessions: Arc<DashMap<String, Outcome>> = Arc::new(DashMap::new());
        let outcome = Outcome::new();
        sessions.insert("ns/web".to_owned(), outcome.clone());

        drop(SessionGuard {
            sessions: Arc::clone(&sessions),
            key: "ns/web".to_owned(),
            outcome: outcome.clone(),
        });

        assert!(sessions.is_empty());
        assert_eq!(
            outcome.peek(),
            Some(Verdict::Failed(ConvergenceFailure::Cancelled))
        );
    }

    #[test]
    fn session_guard_does_not_clobber_a_settled_verdict() {
        let sessions: Arc<DashMap<String, Outcome>> = Arc::new(DashMap::new());
        let outcome = Outcome::new();
        sessions.insert("ns/web".to_owned(), outcome.clone());
        outcome.complete(Verdict::Ready);

        drop(SessionGuard {
            sessions: Arc::clone(&sessions),
            key: "ns/web".to_owned(),
            outcome: outcome.clone(),
        });

        assert!(sessions.is_empty());
        assert_eq!(outcome.peek(), Some(Verdict::Ready));
    }
}
