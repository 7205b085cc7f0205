//! Driver errors - the failure taxonomy surfaced to experiment code
//!
//! Timeouts, kills and restart requests are not errors here: they are
//! values (`ReturnCode::Timeout`, `ReturnCode::Killed`, `Action::Restart`),
//! not failures.

use std::path::PathBuf;
use thiserror::Error;

/// Number of trailing output lines attached to command failures
pub const TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("[{server}] cannot connect to agent at {addr}: {source}")]
    Connect {
        server: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("[{server}] connection to agent lost while running `{command}`: {reason}")]
    ConnectionLost {
        server: String,
        command: String,
        reason: String,
    },

    #[error("[{server}] `{command}` exited with code {code}{}", render_tail(.tail))]
    NonZeroExit {
        server: String,
        command: String,
        code: i32,
        tail: Vec<String>,
    },

    #[error("[{server}] agent failed to spawn `{command}`: {reason}")]
    Spawn {
        server: String,
        command: String,
        reason: String,
    },

    #[error("experiment {experiment} {combination}: restarted {restarts} times, limit is {max_restarts}")]
    MaxRestartsExceeded {
        experiment: String,
        combination: String,
        restarts: u32,
        max_restarts: u32,
    },

    #[error("invalid server selection: {0}")]
    Selection(String),

    #[error("no server with id {0:?}")]
    UnknownServer(String),

    #[error("server index {index} out of range for list of {len}")]
    IndexOutOfRange { index: isize, len: usize },

    #[error("parameter error: {0}")]
    Parameter(String),

    #[error("malformed parameter grid: {0}")]
    Grid(String),

    #[error("invalid format template: {0}")]
    Format(String),

    #[error("failed to write CSV {}: {reason} (unwritten row: {row})", .path.display())]
    CsvWrite {
        path: PathBuf,
        reason: String,
        row: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nlast output:");
    for line in tail {
        out.push_str("\n  | ");
        out.push_str(line);
    }
    out
}

/// Driver-level Result
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_exit_renders_tail() {
        let err = DriverError::NonZeroExit {
            server: "node01".to_string(),
            command: "make -j".to_string(),
            code: 2,
            tail: vec!["cc: error".to_string(), "make: *** [all] Error 1".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("[node01] `make -j` exited with code 2"));
        assert!(msg.contains("  | cc: error"));
        assert!(msg.contains("  | make: *** [all] Error 1"));
    }

    #[test]
    fn test_non_zero_exit_without_output() {
        let err = DriverError::NonZeroExit {
            server: "node02".to_string(),
            command: "exit 3".to_string(),
            code: 3,
            tail: Vec::new(),
        };
        assert_eq!(err.to_string(), "[node02] `exit 3` exited with code 3");
    }

    #[test]
    fn test_connection_lost_names_server_and_command() {
        let err = DriverError::ConnectionLost {
            server: "node03".to_string(),
            command: "sleep 10".to_string(),
            reason: "agent closed the connection".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("node03"));
        assert!(msg.contains("sleep 10"));
    }
}
