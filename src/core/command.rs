//! Command handle - one remote process, its output routing and its fate
//!
//! A pump task drains the command's event channel, feeding each line to the
//! configured sinks before publishing the exit status, so every line has
//! reached its sink by the time `wait()` returns.

use super::connection::{AgentConnection, CommandEvent};
use super::protocol::CommandId;
use super::scheduler;
use super::server::Server;
use crate::error::{DriverError, DriverResult, TAIL_LINES};
use crate::output::{LogSink, Output};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// What `wait()` hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// The process exited with this code
    Exited(i32),
    /// The wait gave up; the remote process may still be running
    Timeout,
    /// The process was terminated through [`Command::kill`]
    Killed,
}

impl ReturnCode {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Exited(0)
    }
}

impl PartialEq<i32> for ReturnCode {
    fn eq(&self, other: &i32) -> bool {
        self.code() == Some(*other)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "{}", code),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Killed => write!(f, "KILLED"),
        }
    }
}

/// Observable lifecycle of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandState {
    Running,
    Completed(i32),
    TimedOut,
    Killed,
    Failed(String),
}

/// Per-command settings for `run_cmd_with`
#[derive(Clone, Default)]
pub struct RunOptions {
    stdout: Option<Output>,
    stderr: Option<Output>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    raise_on_rc: Option<bool>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, output: impl Into<Output>) -> Self {
        self.stdout = Some(output.into());
        self
    }

    pub fn stderr(mut self, output: impl Into<Output>) -> Self {
        self.stderr = Some(output.into());
        self
    }

    /// Overlay one environment variable on the agent's environment
    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.insert(key.into(), value.to_string());
        self
    }

    /// Give up waiting once this much time has passed since the start
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the experiment's `raise_on_rc` for this command
    pub fn raise_on_rc(mut self, raise: bool) -> Self {
        self.raise_on_rc = Some(raise);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Progress {
    Running,
    Exited(i32),
    SpawnFailed(String),
    Lost(String),
}

struct CommandInner {
    id: CommandId,
    server_id: String,
    command: String,
    conn: Arc<AgentConnection>,
    progress: watch::Receiver<Progress>,
    deadline: Option<Instant>,
    raise_on_rc: bool,
    killed: AtomicBool,
    timed_out: AtomicBool,
    stdin_closed: AtomicBool,
    tail: Arc<Mutex<VecDeque<String>>>,
}

/// Handle to a remote process started by `Server::run_cmd`
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

impl Command {
    pub(crate) async fn spawn(
        server: &Server,
        command: String,
        options: RunOptions,
    ) -> DriverResult<Self> {
        let conn = server.connection().await?;
        let raise_on_rc = options
            .raise_on_rc
            .unwrap_or_else(scheduler::default_raise_on_rc);
        let stdout = options
            .stdout
            .unwrap_or_else(|| LogSink::new(server.id(), log::Level::Debug).into());
        let stderr = options
            .stderr
            .unwrap_or_else(|| LogSink::new(server.id(), log::Level::Debug).into());

        log::debug!("[{}] $ {}", server.id(), command);
        let started = Instant::now();
        let (id, events) = conn
            .spawn(&command, server.working_directory(), options.env)
            .await?;

        let (progress_tx, progress_rx) = watch::channel(Progress::Running);
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        tokio::spawn(pump(events, stdout, stderr, progress_tx, tail.clone()));

        let cmd = Self {
            inner: Arc::new(CommandInner {
                id,
                server_id: server.id().to_string(),
                command,
                conn,
                progress: progress_rx,
                deadline: options.timeout.map(|t| started + t),
                raise_on_rc,
                killed: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                stdin_closed: AtomicBool::new(false),
                tail,
            }),
        };
        scheduler::track(&cmd);
        Ok(cmd)
    }

    pub fn id(&self) -> CommandId {
        self.inner.id
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn command(&self) -> &str {
        &self.inner.command
    }

    /// The last few output lines seen so far
    pub fn tail(&self) -> Vec<String> {
        lock_tail(&self.inner.tail).iter().cloned().collect()
    }

    /// True once the agent reported an outcome
    pub fn is_finished(&self) -> bool {
        *self.inner.progress.borrow() != Progress::Running
    }

    pub fn state(&self) -> CommandState {
        if self.inner.timed_out.load(Ordering::SeqCst) {
            return CommandState::TimedOut;
        }
        let progress = self.inner.progress.borrow().clone();
        match progress {
            Progress::Running => CommandState::Running,
            _ if self.inner.killed.load(Ordering::SeqCst) => CommandState::Killed,
            Progress::Exited(code) => CommandState::Completed(code),
            Progress::SpawnFailed(reason) | Progress::Lost(reason) => CommandState::Failed(reason),
        }
    }

    /// Suspend until the process ends or the configured timeout elapses
    pub async fn wait(&self) -> DriverResult<ReturnCode> {
        self.wait_until(self.inner.deadline).await
    }

    /// Like [`wait`](Self::wait) but give up after `timeout` at the latest
    pub async fn wait_timeout(&self, timeout: Duration) -> DriverResult<ReturnCode> {
        let deadline = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(configured) => configured.min(deadline),
            None => deadline,
        };
        self.wait_until(Some(deadline)).await
    }

    async fn wait_until(&self, deadline: Option<Instant>) -> DriverResult<ReturnCode> {
        if self.inner.timed_out.load(Ordering::SeqCst) {
            return Ok(ReturnCode::Timeout);
        }

        let mut rx = self.inner.progress.clone();
        let finished = async move {
            rx.wait_for(|p| *p != Progress::Running)
                .await
                .map(|p| p.clone())
        };

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, finished).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.timed_out.store(true, Ordering::SeqCst);
                    log::warn!(
                        "[{}] timed out waiting for `{}`",
                        self.inner.server_id,
                        self.inner.command
                    );
                    return Ok(ReturnCode::Timeout);
                }
            },
            None => finished.await,
        };

        let progress = outcome.unwrap_or_else(|_| Progress::Lost("command state dropped".into()));
        self.settle(progress)
    }

    fn settle(&self, progress: Progress) -> DriverResult<ReturnCode> {
        let inner = &self.inner;
        match progress {
            Progress::Exited(_) if inner.killed.load(Ordering::SeqCst) => Ok(ReturnCode::Killed),
            Progress::Exited(0) => Ok(ReturnCode::Exited(0)),
            Progress::Exited(code) => {
                if inner.raise_on_rc {
                    return Err(DriverError::NonZeroExit {
                        server: inner.server_id.clone(),
                        command: inner.command.clone(),
                        code,
                        tail: self.tail(),
                    });
                }
                log::debug!("[{}] `{}` exited with {}", inner.server_id, inner.command, code);
                Ok(ReturnCode::Exited(code))
            }
            Progress::SpawnFailed(reason) => Err(DriverError::Spawn {
                server: inner.server_id.clone(),
                command: inner.command.clone(),
                reason,
            }),
            Progress::Lost(reason) => Err(DriverError::ConnectionLost {
                server: inner.server_id.clone(),
                command: inner.command.clone(),
                reason,
            }),
            Progress::Running => Err(DriverError::Protocol(format!(
                "[{}] `{}` settled while still running",
                inner.server_id, inner.command
            ))),
        }
    }

    /// Terminate the remote process; later waits report `Killed`. Idempotent.
    pub async fn kill(&self) -> DriverResult<()> {
        if self.is_finished() || self.inner.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("[{}] killing `{}`", self.inner.server_id, self.inner.command);
        self.inner.conn.kill(self.inner.id, &self.inner.command)
    }

    /// Write to the remote stdin; `close` half-closes it afterwards
    pub async fn stdin(&self, data: impl Into<String>, close: bool) -> DriverResult<()> {
        if self.inner.stdin_closed.load(Ordering::SeqCst) {
            return Err(DriverError::Protocol(format!(
                "[{}] stdin of `{}` is already closed",
                self.inner.server_id, self.inner.command
            )));
        }
        if close {
            self.inner.stdin_closed.store(true, Ordering::SeqCst);
        }
        self.inner
            .conn
            .send_stdin(self.inner.id, &self.inner.command, data.into(), close)
            .await
    }

    /// Forward lines from `reader` until it ends, then close the remote stdin
    pub async fn forward_stdin<R>(&self, reader: R) -> DriverResult<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            if self.is_finished() {
                break;
            }
            self.stdin(format!("{}\n", line), false).await?;
            count += 1;
        }
        if !self.is_finished() {
            self.stdin(String::new(), true).await?;
        }
        Ok(count)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.inner.id)
            .field("server", &self.inner.server_id)
            .field("command", &self.inner.command)
            .field("state", &self.state())
            .finish()
    }
}

fn lock_tail(tail: &Mutex<VecDeque<String>>) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    tail.lock().unwrap_or_else(|e| e.into_inner())
}

fn remember(tail: &Mutex<VecDeque<String>>, line: &str) {
    let mut tail = lock_tail(tail);
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

async fn pump(
    mut events: mpsc::Receiver<CommandEvent>,
    stdout: Output,
    stderr: Output,
    progress: watch::Sender<Progress>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let outcome = loop {
        let Some(event) = events.recv().await else {
            break Progress::Lost("event stream ended without exit status".into());
        };
        match event {
            CommandEvent::Stdout(line) => {
                remember(&tail, &line);
                stdout.deliver(&line);
            }
            CommandEvent::Stderr(line) => {
                remember(&tail, &line);
                stderr.deliver(&line);
            }
            CommandEvent::Exited(code) => break Progress::Exited(code),
            CommandEvent::SpawnFailed(reason) => break Progress::SpawnFailed(reason),
            CommandEvent::Lost(reason) => break Progress::Lost(reason),
        }
    };

    stdout.flush();
    stderr.flush();
    // the handle may already be gone; nobody left to tell
    let _ = progress.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_compares_with_ints() {
        assert!(ReturnCode::Exited(0) == 0);
        assert!(ReturnCode::Exited(2) != 0);
        assert!(ReturnCode::Timeout != 0);
        assert!(ReturnCode::Killed != 0);
        assert!(ReturnCode::Exited(0).is_success());
        assert_eq!(ReturnCode::Timeout.to_string(), "TIMEOUT");
        assert_eq!(ReturnCode::Exited(-9).code(), Some(-9));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let tail = Mutex::new(VecDeque::new());
        for i in 0..(TAIL_LINES + 5) {
            remember(&tail, &i.to_string());
        }
        let tail = lock_tail(&tail);
        assert_eq!(tail.len(), TAIL_LINES);
        assert_eq!(tail.front().map(String::as_str), Some("5"));
    }

    #[tokio::test]
    async fn test_pump_delivers_before_exit() {
        use crate::output::{lock, shared, Lines};

        let (tx, rx) = mpsc::channel(8);
        let (progress_tx, mut progress_rx) = watch::channel(Progress::Running);
        let out = shared(Lines::new());
        let err = shared(Lines::new());
        let tail = Arc::new(Mutex::new(VecDeque::new()));

        tx.send(CommandEvent::Stdout("1".into())).await.unwrap();
        tx.send(CommandEvent::Stderr("oops".into())).await.unwrap();
        tx.send(CommandEvent::Stdout("2".into())).await.unwrap();
        tx.send(CommandEvent::Exited(0)).await.unwrap();

        let task = tokio::spawn(pump(
            rx,
            Output::from(&out),
            Output::from(&err),
            progress_tx,
            tail.clone(),
        ));
        progress_rx
            .wait_for(|p| *p != Progress::Running)
            .await
            .unwrap();

        assert_eq!(lock(&out).lines(), ["1", "2"]);
        assert_eq!(lock(&err).lines(), ["oops"]);
        assert_eq!(lock_tail(&tail).len(), 3);
        task.await.unwrap();
    }

    #[test]
    fn test_run_options_builder() {
        let opts = RunOptions::new()
            .env("OMP_NUM_THREADS", 8)
            .timeout(Duration::from_secs(1))
            .raise_on_rc(false);
        assert_eq!(opts.env["OMP_NUM_THREADS"], "8");
        assert_eq!(opts.timeout, Some(Duration::from_secs(1)));
        assert_eq!(opts.raise_on_rc, Some(false));
        assert!(opts.stdout.is_none());
    }
}
