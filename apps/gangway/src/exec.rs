//! Pod exec capability: given a running instance and a command, stream the
//! remote process's terminal through the bridge until it exits.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::bridge::{BridgeReader, BridgeWriter};
use crate::lifecycle::AppInstance;
use gangway_proto::TerminalGeometry;

/// Upper bound on one relayed stdin chunk. Chunks are never split, so a
/// client frame bigger than this fails the read instead of the protocol
/// silently re-framing it.
pub const STDIN_READ_BUFFER: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The remote process ran and exited non-zero. Not an infrastructure
    /// failure; the gate relays the code to the client.
    #[error("command exited with status {0}")]
    Exit(i32),
    #[error("exec transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait RemoteExec: Send + Sync + 'static {
    /// Run `command` inside the instance's pod, wiring its terminal to the
    /// bridge. Blocks for the lifetime of the remote process.
    async fn stream(
        &self,
        instance: &AppInstance,
        command: &[String],
        reader: &mut BridgeReader,
        writer: &BridgeWriter,
    ) -> Result<(), ExecError>;
}

/// Frames sent to the exec endpoint.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ExecRequest {
    Start {
        command: Vec<String>,
        geometry: TerminalGeometry,
        tty: bool,
    },
    Stdin {
        data: String,
    },
    /// Client input ended; no further `Stdin` frames will follow, so the
    /// remote process sees end-of-file on its stdin.
    StdinEof,
    Resize {
        geometry: TerminalGeometry,
    },
}

/// Frames received from the exec endpoint.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ExecResponse {
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
}

/// Production exec client speaking WebSocket to the cluster's exec endpoint.
pub struct WsExec {
    base: Url,
}

impl WsExec {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    fn exec_url(&self, pod: &str) -> Result<Url, ExecError> {
        self.base
            .join(&format!("exec/{pod}"))
            .map_err(|err| ExecError::Transport(format!("bad exec url: {err}")))
    }
}

#[async_trait]
impl RemoteExec for WsExec {
    async fn stream(
        &self,
        instance: &AppInstance,
        command: &[String],
        reader: &mut BridgeReader,
        writer: &BridgeWriter,
    ) -> Result<(), ExecError> {
        let url = self.exec_url(&instance.pod)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;
        let (mut exec_tx, mut exec_rx) = stream.split();

        let mut last_geometry = reader.geometry();
        send_request(
            &mut exec_tx,
            &ExecRequest::Start {
                command: command.to_vec(),
                geometry: last_geometry,
                tty: true,
            },
        )
        .await?;

        let mut stdin_open = true;
        let mut buf = vec![0u8; STDIN_READ_BUFFER];
        loop {
            // Lazy resize: the geometry cell is polled ahead of every
            // blocking read, so a resize rides ahead of the next chunk.
            let geometry = reader.geometry();
            if geometry != last_geometry {
                send_request(&mut exec_tx, &ExecRequest::Resize { geometry }).await?;
                last_geometry = geometry;
            }

            tokio::select! {
                inbound = exec_rx.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ExecResponse>(text.as_str()) {
                            Ok(ExecResponse::Stdout { data }) => writer
                                .write_stdout(data.as_bytes())
                                .map_err(|err| ExecError::Transport(err.to_string()))?,
                            Ok(ExecResponse::Stderr { data }) => writer
                                .write_stderr(data.as_bytes())
                                .map_err(|err| ExecError::Transport(err.to_string()))?,
                            Ok(ExecResponse::Exit { code: 0 }) => return Ok(()),
                            Ok(ExecResponse::Exit { code }) => return Err(ExecError::Exit(code)),
                            Err(err) => {
                                return Err(ExecError::Transport(format!(
                                    "invalid exec frame: {err}"
                                )))
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ExecError::Transport(
                            "exec stream closed without an exit status".into(),
                        ))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(ExecError::Transport(err.to_string())),
                },
                chunk = reader.read_into(&mut buf), if stdin_open => match chunk {
                    Ok(Some(n)) => {
                        send_request(
                            &mut exec_tx,
                            &ExecRequest::Stdin {
                                data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                            },
                        )
                        .await?;
                    }
                    Ok(None) => {
                        // Client stdin is gone; propagate the end-of-file and
                        // keep draining remote output until the process exits.
                        debug!(pod = %instance.pod, "stdin closed, awaiting process exit");
                        send_request(&mut exec_tx, &ExecRequest::StdinEof).await?;
                        stdin_open = false;
                    }
                    Err(err) => return Err(ExecError::Transport(err.to_string())),
                },
            }
        }
    }
}

async fn send_request<S>(sink: &mut S, request: &ExecRequest) -> Result<(), ExecError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json =
        serde_json::to_string(request).map_err(|err| ExecError::Transport(err.to_string()))?;
    sink.send(Message::text(json))
        .await
        .map_err(|err| ExecError::Transport(err.to_string()))
}
