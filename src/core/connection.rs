//! Agent connection - one persistent TCP stream per server
//!
//! A reader task demultiplexes inbound frames into per-command bounded
//! channels; a writer task drains queued requests. When the per-command
//! channel is full the reader stops reading the socket, so the driver never
//! runs unboundedly ahead of slow sinks. Spawn and kill requests travel on
//! their own queue and are written ahead of pending stdin data.

use super::protocol::{self, CommandId, Request, Response};
use crate::error::{DriverError, DriverResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Connect timeout for a single agent
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered frames per command before the reader applies backpressure
pub const COMMAND_BUFFER: usize = 256;

/// Queued stdin requests per connection
const STDIN_BUFFER: usize = 64;

/// What a command hears from its agent
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Stdout(String),
    Stderr(String),
    Exited(i32),
    SpawnFailed(String),
    Lost(String),
}

type Routes = Arc<Mutex<HashMap<CommandId, mpsc::Sender<CommandEvent>>>>;

/// Multiplexed connection to one agent
pub struct AgentConnection {
    server_id: String,
    addr: String,
    next_id: AtomicU64,
    control: mpsc::UnboundedSender<Request>,
    stdin: mpsc::Sender<Request>,
    routes: Routes,
    lost: Arc<AtomicBool>,
}

impl AgentConnection {
    /// Open a connection and start its reader and writer tasks
    pub async fn connect(server_id: &str, addr: &str) -> DriverResult<Arc<Self>> {
        let connect_err = |source| DriverError::Connect {
            server: server_id.to_string(),
            addr: addr.to_string(),
            source,
        };

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_err(e)),
            Err(_) => {
                return Err(connect_err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no answer within {}s", CONNECT_TIMEOUT.as_secs()),
                )))
            }
        };
        stream.set_nodelay(true).map_err(connect_err)?;
        log::info!("[{}] connected to agent at {}", server_id, addr);

        let (read_half, write_half) = stream.into_split();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_BUFFER);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let lost = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(
            server_id.to_string(),
            write_half,
            control_rx,
            stdin_rx,
        ));
        tokio::spawn(read_loop(
            server_id.to_string(),
            read_half,
            routes.clone(),
            lost.clone(),
        ));

        Ok(Arc::new(Self {
            server_id: server_id.to_string(),
            addr: addr.to_string(),
            next_id: AtomicU64::new(1),
            control: control_tx,
            stdin: stdin_tx,
            routes,
            lost,
        }))
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True once the agent stream has ended or failed
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst) || self.control.is_closed()
    }

    /// Start `command` remotely; events arrive on the returned receiver
    pub async fn spawn(
        &self,
        command: &str,
        cwd: Option<String>,
        env: BTreeMap<String, String>,
    ) -> DriverResult<(CommandId, mpsc::Receiver<CommandEvent>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        lock_routes(&self.routes).insert(id, tx);

        // the reader may have drained routes before our insert landed
        if self.is_lost() {
            lock_routes(&self.routes).remove(&id);
            return Err(self.lost_error(command));
        }

        let request = Request::Spawn {
            id,
            command: command.to_string(),
            cwd,
            env,
        };
        if self.control.send(request).is_err() {
            lock_routes(&self.routes).remove(&id);
            return Err(self.lost_error(command));
        }
        Ok((id, rx))
    }

    /// Write to a command's stdin, optionally closing it afterwards
    ///
    /// Waits while the stdin queue is full; `command` names the command in
    /// the error if the connection is gone.
    pub async fn send_stdin(
        &self,
        id: CommandId,
        command: &str,
        data: String,
        close: bool,
    ) -> DriverResult<()> {
        if self.is_lost() {
            return Err(self.lost_error(command));
        }
        self.stdin
            .send(Request::Stdin { id, data, close })
            .await
            .map_err(|_| self.lost_error(command))
    }

    /// Ask the agent to terminate a command; never waits behind stdin
    pub fn kill(&self, id: CommandId, command: &str) -> DriverResult<()> {
        if self.is_lost() {
            return Err(self.lost_error(command));
        }
        self.control
            .send(Request::Kill { id })
            .map_err(|_| self.lost_error(command))
    }

    fn lost_error(&self, command: &str) -> DriverError {
        DriverError::ConnectionLost {
            server: self.server_id.clone(),
            command: command.to_string(),
            reason: format!("agent at {} is unreachable", self.addr),
        }
    }
}

fn lock_routes(
    routes: &Mutex<HashMap<CommandId, mpsc::Sender<CommandEvent>>>,
) -> std::sync::MutexGuard<'_, HashMap<CommandId, mpsc::Sender<CommandEvent>>> {
    routes.lock().unwrap_or_else(|e| e.into_inner())
}

async fn write_loop(
    server_id: String,
    mut writer: OwnedWriteHalf,
    mut control: mpsc::UnboundedReceiver<Request>,
    mut stdin: mpsc::Receiver<Request>,
) {
    loop {
        let request = tokio::select! {
            biased;
            Some(request) = control.recv() => request,
            Some(request) = stdin.recv() => request,
            else => break,
        };
        let line = match protocol::encode(&request) {
            Ok(line) => line,
            Err(e) => {
                log::error!("[{}] dropping unencodable request: {}", server_id, e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::error!("[{}] agent write failed: {}", server_id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(server_id: String, reader: OwnedReadHalf, routes: Routes, lost: Arc<AtomicBool>) {
    let mut lines = BufReader::new(reader).lines();

    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "agent closed the connection".to_string(),
            Err(e) => break e.to_string(),
        };
        if line.trim().is_empty() {
            continue;
        }

        let response: Response = match protocol::decode(&line) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("[{}] {}", server_id, e);
                continue;
            }
        };

        let id = response.id();
        let (event, last) = match response {
            Response::Stdout { line, .. } => (CommandEvent::Stdout(line), false),
            Response::Stderr { line, .. } => (CommandEvent::Stderr(line), false),
            Response::Exit { code, .. } => (CommandEvent::Exited(code), true),
            Response::Error { message, .. } => (CommandEvent::SpawnFailed(message), true),
        };

        let route = {
            let mut routes = lock_routes(&routes);
            if last {
                routes.remove(&id)
            } else {
                routes.get(&id).cloned()
            }
        };

        match route {
            // a full channel parks the reader here: socket backpressure
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    log::debug!("[{}] command {} no longer listening", server_id, id);
                }
            }
            None => log::debug!("[{}] frame for unknown command {}", server_id, id),
        }
    };

    lost.store(true, Ordering::SeqCst);
    let orphans: Vec<_> = lock_routes(&routes).drain().collect();
    if orphans.is_empty() {
        log::info!("[{}] agent connection closed: {}", server_id, reason);
    } else {
        log::error!(
            "[{}] agent connection lost with {} command(s) running: {}",
            server_id,
            orphans.len(),
            reason
        );
    }
    for (_, tx) in orphans {
        let _ = tx.send(CommandEvent::Lost(reason.clone())).await;
    }
}
