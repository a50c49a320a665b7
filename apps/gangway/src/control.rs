//! Control-plane access for application lifecycle records.
//!
//! The control plane is the single authority for an app's desired and
//! observed phase. Every mutation is a read-modify-write guarded by the
//! record revision; a stale revision is a `Conflict` and gets retried with
//! backoff, because other gate replicas and external controllers race on the
//! same records. Nothing in this process ever treats a cached record as
//! authoritative.

use async_trait::async_trait;
use gangway_proto::AppId;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// Lifecycle phase of an application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Rest,
    Live,
}

/// One application record as stored by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: AppId,
    /// Monotonic revision; updates must carry the revision they read.
    pub revision: u64,
    pub desired_phase: Phase,
    pub observed_phase: Phase,
    /// Pod backing the instance; populated while the app is observed Live.
    pub pod: Option<String>,
    /// Instance-level command prefix prepended to every per-attach command.
    #[serde(default)]
    pub base_command: Vec<String>,
}

/// Watch stream events for a single record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    Updated(AppRecord),
    Deleted,
}

#[derive(Debug, Clone, Error)]
pub enum ControlPlaneError {
    #[error("app {0} not found")]
    NotFound(AppId),
    #[error("revision conflict updating app {0}")]
    Conflict(AppId),
    #[error("control plane unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn fetch(&self, id: &AppId) -> Result<AppRecord, ControlPlaneError>;

    /// Optimistic-concurrency update: fails with `Conflict` when the stored
    /// revision no longer matches `record.revision`.
    async fn update(&self, record: AppRecord) -> Result<AppRecord, ControlPlaneError>;

    /// Open a watch on one record. The returned channel yields the current
    /// record first, then every subsequent change; it closes when the watch
    /// ends for any reason.
    async fn watch(&self, id: &AppId) -> Result<mpsc::Receiver<AppEvent>, ControlPlaneError>;
}

/// Bounded exponential backoff applied to `Conflict` errors only.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or exhausts
/// the policy. Conflicts sleep and double the delay up to the cap.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, ControlPlaneError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ControlPlaneError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Err(ControlPlaneError::Conflict(id)) if attempt < policy.attempts => {
                debug!(app = %id, attempt, delay_ms = delay.as_millis() as u64, "retrying conflicting update");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Production control-plane client speaking the gangway REST surface:
/// `GET/PUT /v1/apps/{ns}/{name}` plus a long-poll `/events` feed.
#[derive(Clone)]
pub struct HttpControlPlane {
    http: reqwest::Client,
    base: Url,
}

impl HttpControlPlane {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    fn app_url(&self, id: &AppId) -> Result<Url, ControlPlaneError> {
        self.base
            .join(&format!("v1/apps/{}/{}", id.namespace, id.name))
            .map_err(|err| ControlPlaneError::Unavailable(format!("bad app url: {err}")))
    }

    fn events_url(&self, id: &AppId, after: u64) -> Result<Url, ControlPlaneError> {
        let mut url = self
            .base
            .join(&format!("v1/apps/{}/{}/events", id.namespace, id.name))
            .map_err(|err| ControlPlaneError::Unavailable(format!("bad events url: {err}")))?;
        url.query_pairs_mut().append_pair("after", &after.to_string());
        Ok(url)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch(&self, id: &AppId) -> Result<AppRecord, ControlPlaneError> {
        let url = self.app_url(id)?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ControlPlaneError::Unavailable(err.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ControlPlaneError::NotFound(id.clone())),
            status if status.is_success() => resp
                .json::<AppRecord>()
                .await
                .map_err(|err| ControlPlaneError::Unavailable(err.to_string())),
            status => Err(ControlPlaneError::Unavailable(format!(
                "fetch of {id} returned {status}"
            ))),
        }
    }

    async fn update(&self, record: AppRecord) -> Result<AppRecord, ControlPlaneError> {
        let id = record.id.clone();
        let url = self.app_url(&id)?;
        let resp = self
            .http
            .put(url)
            .header("If-Match", record.revision.to_string())
            .json(&record)
            .send()
            .await
            .map_err(|err| ControlPlaneError::Unavailable(err.to_string()))?;
        match resp.status() {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(ControlPlaneError::Conflict(id))
            }
            StatusCode::NOT_FOUND => Err(ControlPlaneError::NotFound(id)),
            status if status.is_success() => resp
                .json::<AppRecord>()
                .await
                .map_err(|err| ControlPlaneError::Unavailable(err.to_string())),
            status => Err(ControlPlaneError::Unavailable(format!(
                "update of {id} returned {status}"
            ))),
        }
    }

    async fn watch(&self, id: &AppId) -> Result<mpsc::Receiver<AppEvent>, ControlPlaneError> {
        let (tx, rx) = mpsc::channel(16);
        let plane = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut after = match plane.fetch(&id).await {
                Ok(record) => {
                    let revision = record.revision;
                    if tx.send(AppEvent::Updated(record)).await.is_err() {
                        return;
                    }
                    revision
                }
                Err(ControlPlaneError::NotFound(_)) => {
                    let _ = tx.send(AppEvent::Deleted).await;
                    return;
                }
                Err(err) => {
                    warn!(app = %id, error = %err, "watch bootstrap failed");
                    return;
                }
            };

            loop {
                let url = match plane.events_url(&id, after) {
                    Ok(url) => url,
                    Err(_) => return,
                };
                let resp = match plane.http.get(url).send().await {
                    Ok(resp) => resp,
                    Err(err) => {
                        warn!(app = %id, error = %err, "watch poll failed");
                        return;
                    }
                };
                match resp.status() {
                    // Long-poll window elapsed with no change.
                    StatusCode::NO_CONTENT => continue,
                    StatusCode::NOT_FOUND => {
                        let _ = tx.send(AppEvent::Deleted).await;
                        return;
                    }
                    status if status.is_success() => {
                        let event = match resp.json::<AppEvent>().await {
                            Ok(event) => event,
                            Err(err) => {
                                warn!(app = %id, error = %err, "watch event decode failed");
                                return;
                            }
                        };
                        if let AppEvent::Updated(record) = &event {
                            after = record.revision;
                        }
                        let deleted = matches!(event, AppEvent::Deleted);
                        if tx.send(event).await.is_err() || deleted {
                            return;
                        }
                    }
                    status => {
                        warn!(app = %id, %status, "watch poll rejected");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

pub use memory::MemoryControlPlane;

/// In-memory control plane used by tests and local development. Implements
/// the same revision semantics as the real service and can optionally play
/// the controller role, driving observed phase toward desired phase.
mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::broadcast;

    struct MemoryApp {
        record: AppRecord,
        events: broadcast::Sender<AppEvent>,
    }

    struct MemoryInner {
        apps: Mutex<HashMap<AppId, MemoryApp>>,
        /// Number of upcoming updates to fail with `Conflict`.
        injected_conflicts: AtomicUsize,
        live_flips: AtomicUsize,
        rest_flips: AtomicUsize,
        controller_delay: Mutex<Option<Duration>>,
    }

    #[derive(Clone)]
    pub struct MemoryControlPlane {
        inner: Arc<MemoryInner>,
    }

    impl Default for MemoryControlPlane {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryControlPlane {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(MemoryInner {
                    apps: Mutex::new(HashMap::new()),
                    injected_conflicts: AtomicUsize::new(0),
                    live_flips: AtomicUsize::new(0),
                    rest_flips: AtomicUsize::new(0),
                    controller_delay: Mutex::new(None),
                }),
            }
        }

        /// Act as the controller: `delay` after a desired-phase change, mark
        /// the observed phase caught up (and assign or clear the pod).
        pub fn with_controller(self, delay: Duration) -> Self {
            *self.inner.controller_delay.lock() = Some(delay);
            self
        }

        /// Seed a record at rest.
        pub fn put(&self, id: AppId, base_command: Vec<String>) {
            let (events, _) = broadcast::channel(64);
            let record = AppRecord {
                id: id.clone(),
                revision: 1,
                desired_phase: Phase::Rest,
                observed_phase: Phase::Rest,
                pod: None,
                base_command,
            };
            self.inner.apps.lock().insert(id, MemoryApp { record, events });
        }

        pub fn remove(&self, id: &AppId) {
            if let Some(app) = self.inner.apps.lock().remove(id) {
                let _ = app.events.send(AppEvent::Deleted);
            }
        }

        /// Fail the next `n` updates with `Conflict`.
        pub fn inject_conflicts(&self, n: usize) {
            self.inner.injected_conflicts.store(n, Ordering::SeqCst);
        }

        /// How many updates flipped the desired phase to Live.
        pub fn live_flips(&self) -> usize {
            self.inner.live_flips.load(Ordering::SeqCst)
        }

        /// How many updates flipped the desired phase to Rest.
        pub fn rest_flips(&self) -> usize {
            self.inner.rest_flips.load(Ordering::SeqCst)
        }

        pub fn record(&self, id: &AppId) -> Option<AppRecord> {
            self.inner.apps.lock().get(id).map(|app| app.record.clone())
        }

        fn run_controller(&self, id: AppId, delay: Duration) {
            let plane = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut apps = plane.inner.apps.lock();
                let Some(app) = apps.get_mut(&id) else { return };
                if app.record.observed_phase == app.record.desired_phase {
                    return;
                }
                app.record.observed_phase = app.record.desired_phase;
                app.record.pod = match app.record.desired_phase {
                    Phase::Live => Some(format!("{}-0", id.name)),
                    Phase::Rest => None,
                };
                app.record.revision += 1;
                let _ = app.events.send(AppEvent::Updated(app.record.clone()));
            });
        }
    }

    #[async_trait]
    impl ControlPlane for MemoryControlPlane {
        async fn fetch(&self, id: &AppId) -> Result<AppRecord, ControlPlaneError> {
            self.inner
                .apps
                .lock()
                .get(id)
                .map(|app| app.record.clone())
                .ok_or_else(|| ControlPlaneError::NotFound(id.clone()))
        }

        async fn update(&self, record: AppRecord) -> Result<AppRecord, ControlPlaneError> {
            let id = record.id.clone();
            let controller_delay = *self.inner.controller_delay.lock();
            let (updated, phase_changed) = {
                let mut apps = self.inner.apps.lock();
                let app = apps
                    .get_mut(&id)
                    .ok_or_else(|| ControlPlaneError::NotFound(id.clone()))?;

                if self
                    .inner
                    .injected_conflicts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(ControlPlaneError::Conflict(id));
                }
                if app.record.revision != record.revision {
                    return Err(ControlPlaneError::Conflict(id));
                }

                let phase_changed = app.record.desired_phase != record.desired_phase;
                if phase_changed {
                    match record.desired_phase {
                        Phase::Live => self.inner.live_flips.fetch_add(1, Ordering::SeqCst),
                        Phase::Rest => self.inner.rest_flips.fetch_add(1, Ordering::SeqCst),
                    };
                }
                app.record.desired_phase = record.desired_phase;
                app.record.base_command = record.base_command;
                app.record.revision += 1;
                let _ = app.events.send(AppEvent::Updated(app.record.clone()));
                (app.record.clone(), phase_changed)
            };

            if phase_changed {
                if let Some(delay) = controller_delay {
                    self.run_controller(id, delay);
                }
            }
            Ok(updated)
        }

        async fn watch(&self, id: &AppId) -> Result<mpsc::Receiver<AppEvent>, ControlPlaneError> {
            let (current, mut events) = {
                let apps = self.inner.apps.lock();
                let app = apps
                    .get(id)
                    .ok_or_else(|| ControlPlaneError::NotFound(id.clone()))?;
                (app.record.clone(), app.events.subscribe())
            };

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                if tx.send(AppEvent::Updated(current)).await.is_err() {
                    return;
                }
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let deleted = matches!(event, AppEvent::Deleted);
                            if tx.send(event).await.is_err() || deleted {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn id() -> AppId {
        AppId::new("app", "ctr")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_conflicts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let result = retry_on_conflict(&fast_retry(), move || {
            let calls = counted.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ControlPlaneError::Conflict(id()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_surfaces_the_conflict() {
        let result: Result<(), _> = retry_on_conflict(&fast_retry(), || async {
            Err(ControlPlaneError::Conflict(id()))
        })
        .await;
        assert!(matches!(result, Err(ControlPlaneError::Conflict(_))));
    }

    #[tokio::test]
    async fn retry_does_not_touch_other_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let result: Result<(), _> = retry_on_conflict(&fast_retry(), move || {
            let calls = counted.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ControlPlaneError::NotFound(id()))
            }
        })
        .await;
        assert!(matches!(result, Err(ControlPlaneError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_plane_enforces_revisions() {
        let plane = MemoryControlPlane::new();
        plane.put(id(), vec![]);

        let mut record = plane.fetch(&id()).await.unwrap();
        record.desired_phase = Phase::Live;
        let updated = plane.update(record.clone()).await.unwrap();
        assert_eq!(updated.revision, 2);

        // Re-sending the stale revision conflicts.
        record.desired_phase = Phase::Rest;
        assert!(matches!(
            plane.update(record).await,
            Err(ControlPlaneError::Conflict(_))
        ));
        assert_eq!(plane.live_flips(), 1);
    }

    #[tokio::test]
    async fn memory_plane_injects_conflicts() {
        let plane = MemoryControlPlane::new();
        plane.put(id(), vec![]);
        plane.inject_conflicts(1);

        let record = plane.fetch(&id()).await.unwrap();
        assert!(matches!(
            plane.update(record.clone()).await,
            Err(ControlPlaneError::Conflict(_))
        ));
        // The injected conflict is consumed; the same update now lands.
        plane.update(record).await.unwrap();
    }

    #[tokio::test]
    async fn memory_watch_sees_current_then_changes() {
        let plane = MemoryControlPlane::new();
        plane.put(id(), vec![]);
        let mut watch = plane.watch(&id()).await.unwrap();

        match watch.recv().await {
            Some(AppEvent::Updated(record)) => assert_eq!(record.revision, 1),
            other => panic!("expected bootstrap event, got {other:?}"),
        }

        let mut record = plane.fetch(&id()).await.unwrap();
        record.desired_phase = Phase::Live;
        plane.update(record).await.unwrap();

        match watch.recv().await {
            Some(AppEvent::Updated(record)) => {
                assert_eq!(record.desired_phase, Phase::Live);
                assert_eq!(record.revision, 2);
            }
            other => panic!("expected update event, got {other:?}"),
        }

        plane.remove(&id());
        assert!(matches!(watch.recv().await, Some(AppEvent::Deleted)));
        assert!(watch.recv().await.is_none());
    }
}
