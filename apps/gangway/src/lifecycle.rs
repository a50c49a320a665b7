//! Change Intent execution: drive one app's phase to Live or Rest.
//!
//! Each runner is spawned by the session actor and races its cancellation
//! token so a reversed intent stops mutating remote state promptly. The
//! actor is responsible for ensuring at most one runner per app is alive.

use gangway_proto::AppId;
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::control::{
    retry_on_conflict, AppEvent, AppRecord, ControlPlane, ControlPlaneError, Phase, RetryPolicy,
};

/// Resolved handle to the running backing instance of one app.
#[derive(Debug, Clone, PartialEq)]
pub struct AppInstance {
    pub pod: String,
    /// Prefix every per-attach command is appended to.
    pub base_command: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("superseded by a newer phase change")]
    Superseded,
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error("app {0} was deleted while starting")]
    Deleted(AppId),
    #[error("watch ended before app {0} went live")]
    WatchEnded(AppId),
    #[error("app {0} is live but reports no pod")]
    MissingPod(AppId),
    #[error("session task for app {0} is gone")]
    SessionGone(AppId),
}

pub(crate) fn instance_from(record: AppRecord) -> Result<AppInstance, LifecycleError> {
    match record.pod {
        Some(pod) => Ok(AppInstance {
            pod,
            base_command: record.base_command,
        }),
        None => Err(LifecycleError::MissingPod(record.id)),
    }
}

/// Flip the desired phase to Live and wait until the app is observed Live.
pub(crate) async fn drive_to_live(
    control: Arc<dyn ControlPlane>,
    id: AppId,
    cancel: CancellationToken,
    retry: RetryPolicy,
) -> Result<AppInstance, LifecycleError> {
    let record = tokio::select! {
        _ = cancel.cancelled() => return Err(LifecycleError::Superseded),
        flipped = flip_desired_phase(&*control, &id, Phase::Live, &retry) => flipped?,
    };

    if record.observed_phase == Phase::Live {
        return instance_from(record);
    }

    let mut events = tokio::select! {
        _ = cancel.cancelled() => return Err(LifecycleError::Superseded),
        watch = control.watch(&id) => watch.map_err(LifecycleError::from)?,
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(LifecycleError::Superseded),
            event = events.recv() => match event {
                Some(AppEvent::Updated(record)) if record.observed_phase == Phase::Live => {
                    info!(app = %id, pod = ?record.pod, "app is live");
                    return instance_from(record);
                }
                Some(AppEvent::Updated(_)) => continue,
                Some(AppEvent::Deleted) => return Err(LifecycleError::Deleted(id)),
                None => return Err(LifecycleError::WatchEnded(id)),
            },
        }
    }
}

/// Flip the desired phase to Rest. Teardown completion is the controller's
/// business; the gate does not wait for the observed phase to follow.
pub(crate) async fn drive_to_rest(
    control: Arc<dyn ControlPlane>,
    id: AppId,
    cancel: CancellationToken,
    retry: RetryPolicy,
) -> Result<(), LifecycleError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LifecycleError::Superseded),
        flipped = flip_desired_phase(&*control, &id, Phase::Rest, &retry) => {
            flipped?;
            Ok(())
        }
    }
}

/// Read-modify-write with conflict retry. Short-circuits when the record is
/// already headed to (or at) the target so concurrent coordinators converge
/// without fighting.
async fn flip_desired_phase(
    control: &dyn ControlPlane,
    id: &AppId,
    target: Phase,
    retry: &RetryPolicy,
) -> Result<AppRecord, ControlPlaneError> {
    retry_on_conflict(retry, || async move {
        let record = control.fetch(id).await?;
        let settled = match target {
            Phase::Live => {
                record.desired_phase == Phase::Live || record.observed_phase == Phase::Live
            }
            Phase::Rest => record.desired_phase == Phase::Rest,
        };
        if settled {
            return Ok(record);
        }

        let mut desired = record;
        desired.desired_phase = target;
        let updated = control.update(desired).await?;
        counter!(
            "gangway_phase_flips_total",
            1,
            "target" => match target {
                Phase::Live => "live",
                Phase::Rest => "rest",
            }
        );
        info!(app = %id, ?target, revision = updated.revision, "desired phase updated");
        Ok(updated)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MemoryControlPlane;
    use std::time::Duration;

    fn id() -> AppId {
        AppId::new("app", "ctr")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn arc(plane: &MemoryControlPlane) -> Arc<dyn ControlPlane> {
        Arc::new(plane.clone())
    }

    #[tokio::test]
    async fn start_waits_for_observed_live() {
        let plane = MemoryControlPlane::new().with_controller(Duration::from_millis(10));
        plane.put(id(), vec!["chroot".into(), "/app-root".into()]);

        let instance = drive_to_live(arc(&plane), id(), CancellationToken::new(), fast_retry())
            .await
            .unwrap();
        assert_eq!(instance.pod, "ctr-0");
        assert_eq!(instance.base_command, vec!["chroot", "/app-root"]);
        assert_eq!(plane.live_flips(), 1);
    }

    #[tokio::test]
    async fn start_short_circuits_when_already_live() {
        let plane = MemoryControlPlane::new().with_controller(Duration::ZERO);
        plane.put(id(), vec![]);

        drive_to_live(arc(&plane), id(), CancellationToken::new(), fast_retry())
            .await
            .unwrap();
        drive_to_live(arc(&plane), id(), CancellationToken::new(), fast_retry())
            .await
            .unwrap();
        assert_eq!(plane.live_flips(), 1, "second start must not re-flip");
    }

    #[tokio::test]
    async fn start_retries_through_conflicts() {
        let plane = MemoryControlPlane::new().with_controller(Duration::from_millis(5));
        plane.put(id(), vec![]);
        plane.inject_conflicts(2);

        drive_to_live(arc(&plane), id(), CancellationToken::new(), fast_retry())
            .await
            .unwrap();
        assert_eq!(plane.live_flips(), 1);
    }

    #[tokio::test]
    async fn cancelled_start_exits_promptly() {
        // No controller: the app never goes live, so the runner parks in the
        // watch loop until cancelled.
        let plane = MemoryControlPlane::new();
        plane.put(id(), vec![]);

        let cancel = CancellationToken::new();
        let runner = tokio::spawn(drive_to_live(
            arc(&plane),
            id(),
            cancel.clone(),
            fast_retry(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("runner must observe cancellation")
            .unwrap();
        assert!(matches!(result, Err(LifecycleError::Superseded)));
    }

    #[tokio::test]
    async fn deletion_during_start_fails_the_intent() {
        let plane = MemoryControlPlane::new();
        plane.put(id(), vec![]);

        let runner = tokio::spawn(drive_to_live(
            arc(&plane),
            id(),
            CancellationToken::new(),
            fast_retry(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        plane.remove(&id());

        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("runner must observe deletion")
            .unwrap();
        assert!(matches!(result, Err(LifecycleError::Deleted(_))));
    }

    #[tokio::test]
    async fn stop_flips_to_rest_without_waiting() {
        let plane = MemoryControlPlane::new().with_controller(Duration::ZERO);
        plane.put(id(), vec![]);
        drive_to_live(arc(&plane), id(), CancellationToken::new(), fast_retry())
            .await
            .unwrap();

        drive_to_rest(arc(&plane), id(), CancellationToken::new(), fast_retry())
            .await
            .unwrap();
        assert_eq!(plane.rest_flips(), 1);
        assert_eq!(
            plane.record(&id()).unwrap().desired_phase,
            Phase::Rest,
            "stop only records intent; observed phase is the controller's job"
        );

        // Stopping an app already headed to rest is a no-op.
        drive_to_rest(arc(&plane), id(), CancellationToken::new(), fast_retry())
            .await
            .unwrap();
        assert_eq!(plane.rest_flips(), 1);
    }

    #[test]
    fn live_record_without_pod_is_an_error() {
        let record = AppRecord {
            id: id(),
            revision: 3,
            desired_phase: Phase::Live,
            observed_phase: Phase::Live,
            pod: None,
            base_command: vec![],
        };
        assert!(matches!(
            instance_from(record),
            Err(LifecycleError::MissingPod(_))
        ));
    }
}
