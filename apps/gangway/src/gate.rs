//! The session gate: one WebSocket connection per client attach.
//!
//! Each connection performs a handshake (the first frame must fully describe
//! the attach), opens the session, streams the remote terminal, and always
//! detaches exactly once, including when the open itself failed or the
//! client vanished mid-start. The stream ends with a single `Status` frame
//! so clients can reproduce shell-style exit codes.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeInput, BridgeReader, BridgeWriter, TerminalBridge};
use crate::exec::{ExecError, RemoteExec};
use crate::lifecycle::AppInstance;
use crate::session::SessionRegistry;
use gangway_proto::{AppId, ClientFrame, ServerFrame};

/// How long a disconnected client's exec stream may keep running, so a
/// well-behaved remote process can exit on stdin end-of-file before the
/// stream is torn down.
const DISCONNECT_DRAIN: Duration = Duration::from_millis(500);

pub struct GateState {
    pub registry: SessionRegistry,
    pub exec: Arc<dyn RemoteExec>,
    pub handshake_timeout: Duration,
    pub metrics: PrometheusHandle,
}

impl GateState {
    pub fn new(
        registry: SessionRegistry,
        exec: Arc<dyn RemoteExec>,
        handshake_timeout: Duration,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            registry,
            exec,
            handshake_timeout,
            metrics,
        }
    }
}

pub fn router(state: Arc<GateState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<GateState>>) -> impl IntoResponse {
    let sessions = state.registry.stats().await;
    Json(json!({
        "session_count": state.registry.len(),
        "sessions": sessions,
    }))
}

async fn metrics_handler(State(state): State<Arc<GateState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(State(state): State<Arc<GateState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<GateState>) {
    let attach_id = Uuid::new_v4();
    let (ws_tx, ws_rx) = socket.split();

    // All outbound traffic funnels through one writer task so output frames
    // and the final status frame never interleave mid-message.
    let (frames, frames_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(forward_frames(ws_tx, frames_rx));

    let status = serve_attach(&state, attach_id, &frames, ws_rx).await;
    if let ServerFrame::Status { code, message } = &status {
        counter!("gangway_attach_results_total", 1, "code" => code.as_str());
        debug!(%attach_id, code = code.as_str(), %message, "attach finished");
    }
    let _ = frames.send(status);

    // Dropping our sender lets the writer drain the queue and close cleanly.
    drop(frames);
    let _ = writer.await;
}

async fn forward_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut frames: mpsc::UnboundedReceiver<ServerFrame>,
) {
    while let Some(frame) = frames.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "dropping unencodable frame");
                continue;
            }
        };
        if ws_tx.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn serve_attach(
    state: &GateState,
    attach_id: Uuid,
    frames: &mpsc::UnboundedSender<ServerFrame>,
    mut ws_rx: SplitStream<WebSocket>,
) -> ServerFrame {
    // Handshake: the first frame must be a complete open frame, inside the
    // timeout window. Rejected before any remote side effect.
    let first = match timeout(state.handshake_timeout, next_client_frame(&mut ws_rx)).await {
        Err(_) => return ServerFrame::invalid_argument("no open frame within the handshake window"),
        Ok(None) => return ServerFrame::invalid_argument("stream closed before the open frame"),
        Ok(Some(Err(reason))) => return ServerFrame::invalid_argument(reason),
        Ok(Some(Ok(frame))) => frame,
    };

    let (app, command, geometry) = match first {
        ClientFrame::Open {
            app,
            command,
            geometry,
        } => (app, command, geometry),
        ClientFrame::Input { .. } => {
            return ServerFrame::invalid_argument("first frame must be open")
        }
    };
    if app.namespace.is_empty() {
        return ServerFrame::invalid_argument("app.namespace is required in the open frame");
    }
    if app.name.is_empty() {
        return ServerFrame::invalid_argument("app.name is required in the open frame");
    }
    if command.is_empty() {
        return ServerFrame::invalid_argument("command is required in the open frame");
    }
    let Some(geometry) = geometry else {
        return ServerFrame::invalid_argument("geometry is required in the open frame");
    };

    info!(%app, %attach_id, ?command, "attach requested");
    let session = state.registry.session(&app);

    // The bridge and socket read loop start before the open so a client
    // disconnect is observable while the start is still in flight. The read
    // loop cancels `disconnect` when the socket is done.
    let (input, mut reader) = TerminalBridge::channel(geometry);
    let disconnect = CancellationToken::new();
    let read_loop = tokio::spawn(read_client_frames(
        ws_rx,
        input,
        attach_id,
        disconnect.clone(),
    ));

    // The attach is counted once the ticket is queued; every path below owes
    // the single close at the bottom.
    let status = match session.open_queued().await {
        Err(err) => {
            warn!(%app, %attach_id, error = %err, "attach could not be queued");
            ServerFrame::unavailable(err.to_string())
        }
        Ok(ticket) => {
            let opened = tokio::select! {
                opened = ticket.ready() => Some(opened),
                _ = disconnect.cancelled() => None,
            };
            match opened {
                Some(Ok(instance)) => {
                    let mut full_command = instance.base_command.clone();
                    full_command.extend(command);
                    info!(%app, %attach_id, pod = %instance.pod, "opening exec stream");
                    run_exec(
                        state,
                        &app,
                        attach_id,
                        &full_command,
                        &instance,
                        &mut reader,
                        frames,
                        &disconnect,
                    )
                    .await
                }
                Some(Err(err)) => {
                    warn!(%app, %attach_id, error = %err, "attach failed to start the instance");
                    ServerFrame::unavailable(err.to_string())
                }
                None => {
                    // Abandoning the ticket is fine: the close below both
                    // rebalances the count and cancels the pending start.
                    info!(%app, %attach_id, "client disconnected before the instance was ready");
                    ServerFrame::unavailable("client disconnected before the instance was ready")
                }
            }
        }
    };

    reader.close();
    read_loop.abort();

    // The matching detach runs exactly once, whatever happened above.
    if let Err(err) = session.close().await {
        warn!(%app, %attach_id, error = %err, "session stop failed on detach");
        counter!("gangway_stop_failures_total", 1);
    }

    status
}

/// Socket read loop: feeds resizes and stdin into the bridge until the
/// client disconnects or violates the protocol, then flags the disconnect.
/// Dropping the input half signals stdin end-of-stream to the exec layer.
async fn read_client_frames(
    mut ws_rx: SplitStream<WebSocket>,
    input: BridgeInput,
    attach_id: Uuid,
    disconnect: CancellationToken,
) {
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(%attach_id, error = %err, "client stream error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Input { geometry, stdin }) => {
                    if let Err(err) = input.push_frame(geometry, stdin).await {
                        warn!(%attach_id, error = %err, "input frame rejected");
                        break;
                    }
                }
                Ok(ClientFrame::Open { .. }) => {
                    warn!(%attach_id, "duplicate open frame");
                    break;
                }
                Err(err) => {
                    warn!(%attach_id, error = %err, "unparseable client frame");
                    break;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        }
    }
    drop(input);
    disconnect.cancel();
}

#[allow(clippy::too_many_arguments)]
async fn run_exec(
    state: &GateState,
    app: &AppId,
    attach_id: Uuid,
    command: &[String],
    instance: &AppInstance,
    reader: &mut BridgeReader,
    frames: &mpsc::UnboundedSender<ServerFrame>,
    disconnect: &CancellationToken,
) -> ServerFrame {
    let writer = BridgeWriter::new(frames.clone());

    let stream = state.exec.stream(instance, command, reader, &writer);
    tokio::pin!(stream);
    let result = tokio::select! {
        result = &mut stream => result,
        _ = disconnect.cancelled() => {
            // The client is gone; the remote may still exit cleanly on stdin
            // end-of-file, so drain briefly before tearing the stream down.
            debug!(%app, %attach_id, "client disconnected, draining exec stream");
            match timeout(DISCONNECT_DRAIN, &mut stream).await {
                Ok(result) => result,
                Err(_) => Err(ExecError::Transport("client disconnected".into())),
            }
        }
    };

    match result {
        Ok(()) => ServerFrame::ok(),
        Err(ExecError::Exit(code)) => {
            info!(%app, %attach_id, code, "remote process exited non-zero");
            ServerFrame::aborted(code)
        }
        Err(err) => {
            warn!(%app, %attach_id, error = %err, "exec stream failed");
            ServerFrame::unavailable(err.to_string())
        }
    }
}

async fn next_client_frame(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Option<Result<ClientFrame, String>> {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                return Some(
                    serde_json::from_str(&text).map_err(|err| format!("invalid open frame: {err}")),
                )
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(err) => return Some(Err(format!("websocket error: {err}"))),
        }
    }
    None
}
