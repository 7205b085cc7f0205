//! Agent wire protocol - newline-delimited JSON frames
//!
//! One TCP connection per server carries every command of the driver run.
//! Each frame is a single JSON object on its own line, tagged by `type`.
//! Command ids are chosen by the driver and are unique per connection.

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-connection command identifier
pub type CommandId = u64;

/// Frames sent from the driver to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Spawn {
        id: CommandId,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Stdin {
        id: CommandId,
        data: String,
        #[serde(default)]
        close: bool,
    },
    Kill {
        id: CommandId,
    },
}

/// Frames streamed from an agent back to the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Stdout { id: CommandId, line: String },
    Stderr { id: CommandId, line: String },
    Exit { id: CommandId, code: i32 },
    Error { id: CommandId, message: String },
}

impl Response {
    pub fn id(&self) -> CommandId {
        match self {
            Self::Stdout { id, .. }
            | Self::Stderr { id, .. }
            | Self::Exit { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }
}

/// Serialize a frame into one protocol line, newline included
pub fn encode<T: Serialize>(frame: &T) -> DriverResult<String> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| DriverError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line (trailing newline optional)
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> DriverResult<T> {
    serde_json::from_str(line.trim_end_matches(['\r', '\n']))
        .map_err(|e| DriverError::Protocol(format!("bad frame {:?}: {}", line, e)))
}
