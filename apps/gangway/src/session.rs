//! Reference-counted session lifecycle, one actor task per app identity.
//!
//! All session state (attach count, cached instance, in-flight intent) is
//! owned by a single task and reachable only through its command queue, so
//! count transitions and intent replacement are serialized by construction.
//! Intents carry a monotonically increasing token; a completion whose token
//! no longer matches the registered intent is stale and discarded.

use dashmap::DashMap;
use gangway_proto::AppId;
use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{ControlPlane, RetryPolicy};
use crate::lifecycle::{drive_to_live, drive_to_rest, AppInstance, LifecycleError};

const COMMAND_QUEUE_DEPTH: usize = 32;

type OpenReply = oneshot::Sender<Result<AppInstance, LifecycleError>>;
type CloseReply = oneshot::Sender<Result<(), LifecycleError>>;

enum SessionCommand {
    Open {
        reply: OpenReply,
    },
    Close {
        reply: CloseReply,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    IntentFinished {
        token: u64,
        outcome: IntentOutcome,
    },
}

enum IntentOutcome {
    Started(Result<AppInstance, LifecycleError>),
    Stopped(Result<(), LifecycleError>),
}

/// Snapshot reported on `/debug/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub app: String,
    pub attached: u32,
    pub live: bool,
}

/// The at-most-one outstanding phase-flip intent of a session.
enum Intent {
    Idle,
    Starting {
        token: u64,
        cancel: CancellationToken,
        waiters: Vec<OpenReply>,
    },
    Stopping {
        token: u64,
        cancel: CancellationToken,
        waiters: Vec<CloseReply>,
    },
}

impl Intent {
    fn token(&self) -> Option<u64> {
        match self {
            Intent::Idle => None,
            Intent::Starting { token, .. } | Intent::Stopping { token, .. } => Some(*token),
        }
    }
}

/// Cheap handle to one session actor.
#[derive(Clone)]
pub struct SessionHandle {
    id: AppId,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Attach one client: bumps the count and blocks until the backing
    /// instance is ready (or the start attempt fails).
    pub async fn open(&self) -> Result<AppInstance, LifecycleError> {
        self.open_queued().await?.ready().await
    }

    /// Queue the attach and return before the instance is ready, so callers
    /// can race readiness against their own cancellation. Once this returns,
    /// the attach is ordered ahead of any later command on this handle and
    /// owes a matching `close` whether or not the ticket is ever awaited.
    pub async fn open_queued(&self) -> Result<OpenTicket, LifecycleError> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(SessionCommand::Open { reply })
            .await
            .map_err(|_| LifecycleError::SessionGone(self.id.clone()))?;
        Ok(OpenTicket {
            id: self.id.clone(),
            result,
        })
    }

    /// Detach one client. The last detach drives the instance to rest and
    /// blocks until the stop intent resolves. Calling close more times than
    /// open is a programming error and kills the session actor.
    pub async fn close(&self) -> Result<(), LifecycleError> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(SessionCommand::Close { reply })
            .await
            .map_err(|_| LifecycleError::SessionGone(self.id.clone()))?;
        result
            .await
            .map_err(|_| LifecycleError::SessionGone(self.id.clone()))?
    }

    pub async fn stats(&self) -> Option<SessionStats> {
        let (reply, result) = oneshot::channel();
        self.tx.send(SessionCommand::Stats { reply }).await.ok()?;
        result.await.ok()
    }
}

/// One queued attach awaiting instance readiness. Dropping the ticket
/// abandons the wait, not the attach: the count stays up until the matching
/// `close`, which also cancels a start the ticket holder walked away from.
pub struct OpenTicket {
    id: AppId,
    result: oneshot::Receiver<Result<AppInstance, LifecycleError>>,
}

impl OpenTicket {
    pub async fn ready(self) -> Result<AppInstance, LifecycleError> {
        self.result
            .await
            .map_err(|_| LifecycleError::SessionGone(self.id))?
    }
}

pub(crate) fn spawn_session(
    id: AppId,
    control: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let handle = SessionHandle {
        id: id.clone(),
        tx: tx.clone(),
    };
    let mut actor = SessionActor {
        id,
        control,
        retry,
        active: 0,
        instance: None,
        intent: Intent::Idle,
        next_token: 0,
        self_tx: tx,
    };
    let task = tokio::spawn(async move {
        // The actor holds a sender to itself for intent completions, so this
        // loop ends only if the task is aborted; sessions are retained for
        // the life of the process.
        while let Some(command) = rx.recv().await {
            actor.handle(command);
        }
    });
    (handle, task)
}

struct SessionActor {
    id: AppId,
    control: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    active: u32,
    instance: Option<AppInstance>,
    intent: Intent,
    next_token: u64,
    self_tx: mpsc::Sender<SessionCommand>,
}

impl SessionActor {
    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Open { reply } => self.handle_open(reply),
            SessionCommand::Close { reply } => self.handle_close(reply),
            SessionCommand::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    app: self.id.to_string(),
                    attached: self.active,
                    live: self.instance.is_some(),
                });
            }
            SessionCommand::IntentFinished { token, outcome } => {
                self.handle_intent_finished(token, outcome)
            }
        }
    }

    fn handle_open(&mut self, reply: OpenReply) {
        self.active += 1;
        counter!("gangway_attaches_total", 1);
        gauge!("gangway_attached_clients", self.active as f64, "app" => self.id.to_string());

        if let Some(instance) = &self.instance {
            // A cached instance implies no stop is pending: starting a stop
            // clears the cache first.
            debug_assert!(!matches!(self.intent, Intent::Stopping { .. }));
            let _ = reply.send(Ok(instance.clone()));
            return;
        }

        match std::mem::replace(&mut self.intent, Intent::Idle) {
            Intent::Starting {
                token,
                cancel,
                mut waiters,
            } => {
                // Collapse: late attachers piggyback on the in-flight start.
                waiters.push(reply);
                self.intent = Intent::Starting {
                    token,
                    cancel,
                    waiters,
                };
            }
            Intent::Stopping {
                token,
                cancel,
                waiters,
            } => {
                debug!(app = %self.id, token, "open supersedes in-flight stop");
                cancel.cancel();
                for waiter in waiters {
                    let _ = waiter.send(Err(LifecycleError::Superseded));
                }
                self.begin_start(reply);
            }
            Intent::Idle => self.begin_start(reply),
        }
    }

    fn handle_close(&mut self, reply: CloseReply) {
        if self.active == 0 {
            panic!("session {}: close without a matching open", self.id);
        }
        self.active -= 1;
        gauge!("gangway_attached_clients", self.active as f64, "app" => self.id.to_string());

        if self.active > 0 {
            let _ = reply.send(Ok(()));
            return;
        }

        // Last client is gone: forget the instance before the stop intent is
        // even created so racing opens go through a fresh start.
        self.instance = None;

        match std::mem::replace(&mut self.intent, Intent::Idle) {
            Intent::Starting {
                token,
                cancel,
                waiters,
            } => {
                debug!(app = %self.id, token, "close supersedes in-flight start");
                cancel.cancel();
                for waiter in waiters {
                    let _ = waiter.send(Err(LifecycleError::Superseded));
                }
                self.begin_stop(reply);
            }
            Intent::Stopping {
                token,
                cancel,
                mut waiters,
            } => {
                waiters.push(reply);
                self.intent = Intent::Stopping {
                    token,
                    cancel,
                    waiters,
                };
            }
            Intent::Idle => self.begin_stop(reply),
        }
    }

    fn handle_intent_finished(&mut self, token: u64, outcome: IntentOutcome) {
        if self.intent.token() != Some(token) {
            debug!(app = %self.id, token, "discarding stale intent completion");
            return;
        }

        match (
            std::mem::replace(&mut self.intent, Intent::Idle),
            outcome,
        ) {
            (Intent::Starting { waiters, .. }, IntentOutcome::Started(result)) => match result {
                Ok(instance) => {
                    debug_assert!(self.active > 0, "start completed with no attached clients");
                    info!(app = %self.id, pod = %instance.pod, "session instance ready");
                    self.instance = Some(instance.clone());
                    for waiter in waiters {
                        let _ = waiter.send(Ok(instance.clone()));
                    }
                }
                Err(err) => {
                    warn!(app = %self.id, error = %err, "session start failed");
                    counter!("gangway_start_failures_total", 1);
                    for waiter in waiters {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
            },
            (Intent::Stopping { waiters, .. }, IntentOutcome::Stopped(result)) => {
                if let Err(err) = &result {
                    warn!(app = %self.id, error = %err, "session stop failed");
                }
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            _ => {
                // Tokens are unique per intent, so a variant mismatch cannot
                // happen; keep the actor alive regardless.
                warn!(app = %self.id, token, "intent completion variant mismatch");
            }
        }
    }

    fn begin_start(&mut self, reply: OpenReply) {
        let token = self.issue_token();
        let cancel = CancellationToken::new();
        self.intent = Intent::Starting {
            token,
            cancel: cancel.clone(),
            waiters: vec![reply],
        };

        let control = self.control.clone();
        let id = self.id.clone();
        let retry = self.retry.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = drive_to_live(control, id, cancel, retry).await;
            let _ = tx
                .send(SessionCommand::IntentFinished {
                    token,
                    outcome: IntentOutcome::Started(result),
                })
                .await;
        });
    }

    fn begin_stop(&mut self, reply: CloseReply) {
        let token = self.issue_token();
        let cancel = CancellationToken::new();
        self.intent = Intent::Stopping {
            token,
            cancel: cancel.clone(),
            waiters: vec![reply],
        };

        let control = self.control.clone();
        let id = self.id.clone();
        let retry = self.retry.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = drive_to_rest(control, id, cancel, retry).await;
            let _ = tx
                .send(SessionCommand::IntentFinished {
                    token,
                    outcome: IntentOutcome::Stopped(result),
                })
                .await;
        });
    }

    fn issue_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Process-wide session table. Entries are created lazily on first attach
/// and kept for the process lifetime, matching the behavior of the service
/// this replaces; `/debug/stats` exposes the table so growth is visible.
pub struct SessionRegistry {
    sessions: DashMap<AppId, SessionHandle>,
    control: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
}

impl SessionRegistry {
    pub fn new(control: Arc<dyn ControlPlane>, retry: RetryPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            control,
            retry,
        }
    }

    /// Look up or create the session for an identity.
    pub fn session(&self, id: &AppId) -> SessionHandle {
        let handle = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| {
                info!(app = %id, "creating session");
                let (handle, _task) =
                    spawn_session(id.clone(), self.control.clone(), self.retry.clone());
                handle
            })
            .clone();
        gauge!("gangway_sessions_total", self.sessions.len() as f64);
        handle
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn stats(&self) -> Vec<SessionStats> {
        // Collect handles before awaiting so no map guard is held across a
        // suspension point.
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(entry) = handle.stats().await {
                stats.push(entry);
            }
        }
        stats
    }
}
