//! Shared wire definitions for the gangway attach stream.
//! Keeping these in a dedicated crate lets terminal clients link the frame
//! types without pulling in the gate's runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of one logical application instance inside the cluster.
///
/// Immutable once a session exists for it; used as the key of the gate's
/// process-wide session table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId {
    pub namespace: String,
    pub name: String,
}

impl AppId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Character-cell dimensions of the client terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalGeometry {
    pub width: u16,
    pub height: u16,
}

/// Frames sent from a terminal client to the gate.
///
/// The first frame on a connection must be `Open`; every later frame is
/// `Input` and may carry a resize and/or at most one stdin chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Open {
        app: AppId,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        geometry: Option<TerminalGeometry>,
    },
    Input {
        #[serde(default)]
        geometry: Option<TerminalGeometry>,
        #[serde(default)]
        stdin: Vec<String>,
    },
}

/// Frames sent from the gate back to the client. Output is relayed as it is
/// produced; a single `Status` frame terminates every stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Stdout { data: String },
    Stderr { data: String },
    Status { code: StatusCode, message: String },
}

impl ServerFrame {
    pub fn ok() -> Self {
        ServerFrame::Status {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ServerFrame::Status {
            code: StatusCode::InvalidArgument,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ServerFrame::Status {
            code: StatusCode::Unavailable,
            message: message.into(),
        }
    }

    /// Non-zero remote exit, carrying the numeric code as the message so
    /// clients can reproduce shell-style exit codes.
    pub fn aborted(exit_code: i32) -> Self {
        ServerFrame::Status {
            code: StatusCode::Aborted,
            message: exit_code.to_string(),
        }
    }
}

/// Terminal status of an attach stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    Unavailable,
    Aborted,
}

impl StatusCode {
    /// Stable snake_case name, identical to the wire encoding. Suitable for
    /// metric labels and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Aborted => "aborted",
        }
    }
}

/// Error returned when a `Status` frame cannot be turned back into a shell
/// exit code on the client side.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("aborted status carries a non-numeric exit code: {0:?}")]
    BadExitCode(String),
}

/// Decode the exit code a client should propagate for a terminal `Status`
/// frame: 0 for a clean close, the encoded code for `Aborted`.
pub fn exit_code(code: StatusCode, message: &str) -> Result<Option<i32>, StatusError> {
    match code {
        StatusCode::Ok => Ok(Some(0)),
        StatusCode::Aborted => message
            .parse::<i32>()
            .map(Some)
            .map_err(|_| StatusError::BadExitCode(message.to_string())),
        StatusCode::InvalidArgument | StatusCode::Unavailable => Ok(None),
    }
}
