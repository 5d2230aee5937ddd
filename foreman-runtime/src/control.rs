//! Control protocol: newline-delimited JSON over the control socket.
//!
//! Deliberately simpler than the framed transport — a human can drive it
//! with `nc -U`. Recognized commands: `status`, `dispatch`, `stop`.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use foreman_core::types::Task;

use crate::error::{io_err, RuntimeError};
use crate::paths::control_socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub cmd: String,
    /// Payload for `dispatch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the control socket and return one response.
pub fn send_request(root: &Path, request: &ControlRequest) -> Result<ControlResponse, RuntimeError> {
    let socket = control_socket_path(root);
    if !socket.exists() {
        return Err(RuntimeError::NotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            RuntimeError::NotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(RuntimeError::Protocol(
            "coordinator closed connection before responding".to_string(),
        ));
    }

    let response: ControlResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Fetch coordinator status, retrying briefly while the socket appears.
pub fn request_status(root: &Path) -> Result<Value, RuntimeError> {
    let request = ControlRequest {
        cmd: "status".to_string(),
        task: None,
    };

    let mut last_not_running: Option<RuntimeError> = None;
    for attempt in 0..5 {
        match send_request(root, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ RuntimeError::NotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        RuntimeError::Protocol("status retry loop exited unexpectedly".to_string())
    }))
}

/// Submit a task for dispatch through the pool manager.
pub fn request_dispatch(root: &Path, task: Task) -> Result<Value, RuntimeError> {
    let response = send_request(
        root,
        &ControlRequest {
            cmd: "dispatch".to_string(),
            task: Some(task),
        },
    )?;
    response_into_data(response)
}

/// Ask the coordinator to shut down.
pub fn request_stop(root: &Path) -> Result<(), RuntimeError> {
    let response = send_request(
        root,
        &ControlRequest {
            cmd: "stop".to_string(),
            task: None,
        },
    )?;
    response_into_data(response).map(|_| ())
}

fn response_into_data(response: ControlResponse) -> Result<Value, RuntimeError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(RuntimeError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown coordinator error".to_string()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
