//! Remote agent - executes driver commands and streams their I/O back
//!
//! Every command runs under `bash -c` in its own process group so a kill
//! reaches the whole pipeline. The exit frame is sent only after both output
//! streams hit end of file. Responses go through a bounded channel: a slow
//! driver stalls the pipe readers, which in turn stalls the child. The request
//! loop itself never waits on a child, so a kill always gets through.

use crate::core::protocol::{self, CommandId, Request, Response};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Frames queued towards the driver per connection
const RESPONSE_BUFFER: usize = 1024;

/// Directory for commands that do not ask for one: the agent user's home
pub fn default_working_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// A bound agent, ready to serve drivers
pub struct Agent {
    listener: TcpListener,
    working_dir: PathBuf,
}

impl Agent {
    pub async fn bind(addr: &str, working_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            working_dir: working_dir.into(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept drivers until the listener fails
    pub async fn serve(self) -> io::Result<()> {
        log::info!(
            "agent listening on {} (default cwd {})",
            self.local_addr()?,
            self.working_dir.display()
        );
        loop {
            let (stream, peer) = self.listener.accept().await?;
            log::info!("driver connected from {}", peer);
            let working_dir = self.working_dir.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, working_dir).await {
                    log::warn!("connection from {} ended with error: {}", peer, e);
                }
                log::info!("driver {} disconnected", peer);
            });
        }
    }
}

/// A command the agent is running for a connection
struct Running {
    // queued in front of a child that may not be reading
    stdin: Option<mpsc::UnboundedSender<(String, bool)>>,
    // fires on request; dropping it unsent kills too
    kill: Option<oneshot::Sender<()>>,
}

type Table = Arc<Mutex<HashMap<CommandId, Running>>>;

fn lock_table(table: &Table) -> std::sync::MutexGuard<'_, HashMap<CommandId, Running>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

async fn handle_connection(stream: TcpStream, working_dir: PathBuf) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
    let writer = tokio::spawn(write_responses(write_half, rx));
    let table: Table = Arc::new(Mutex::new(HashMap::new()));

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match protocol::decode(&line) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("{}", e);
                continue;
            }
        };

        match request {
            Request::Spawn {
                id,
                command,
                cwd,
                env,
            } => {
                if lock_table(&table).contains_key(&id) {
                    let message = format!("command id {} is already running", id);
                    reply(&tx, Response::Error { id, message });
                    continue;
                }
                let dir = resolve_cwd(&working_dir, cwd.as_deref());
                match spawn_child(&command, &dir, &env) {
                    Ok(child) => start(id, command, child, tx.clone(), table.clone()),
                    Err(e) => {
                        log::warn!("cannot spawn `{}` in {}: {}", command, dir.display(), e);
                        let message = format!("{} (cwd {})", e, dir.display());
                        reply(&tx, Response::Error { id, message });
                    }
                }
            }
            Request::Stdin { id, data, close } => {
                let sender = {
                    let mut table = lock_table(&table);
                    match table.get_mut(&id) {
                        Some(running) if close => running.stdin.take(),
                        Some(running) => running.stdin.clone(),
                        None => None,
                    }
                };
                match sender {
                    Some(sender) => {
                        if sender.send((data, close)).is_err() {
                            log::debug!("stdin of command {} is gone", id);
                        }
                    }
                    None => log::debug!("stdin for finished or closed command {}", id),
                }
            }
            Request::Kill { id } => {
                let kill = lock_table(&table).get_mut(&id).and_then(|r| r.kill.take());
                match kill {
                    Some(kill) => {
                        log::info!("killing command {}", id);
                        let _ = kill.send(());
                    }
                    None => log::debug!("kill for finished command {}", id),
                }
            }
        }
    }

    // the driver is gone; take every child with it
    let orphans = lock_table(&table).drain().count();
    if orphans > 0 {
        log::warn!("driver hung up, killing {} running command(s)", orphans);
    }
    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Queue a response without holding up the request loop
fn reply(tx: &mpsc::Sender<Response>, response: Response) {
    let tx = tx.clone();
    tokio::spawn(async move {
        let _ = tx.send(response).await;
    });
}

async fn write_responses(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Response>) {
    while let Some(response) = rx.recv().await {
        let line = match protocol::encode(&response) {
            Ok(line) => line,
            Err(e) => {
                log::error!("dropping unencodable response: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::debug!("driver write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn resolve_cwd(default: &Path, requested: Option<&str>) -> PathBuf {
    match requested {
        Some(dir) if dir == "~" => default_working_dir(),
        Some(dir) => match dir.strip_prefix("~/") {
            Some(rest) => default_working_dir().join(rest),
            None => default.join(dir),
        },
        None => default.to_path_buf(),
    }
}

fn spawn_child(command: &str, cwd: &Path, env: &BTreeMap<String, String>) -> io::Result<Child> {
    let mut cmd = tokio::process::Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
}

fn start(id: CommandId, command: String, mut child: Child, tx: mpsc::Sender<Response>, table: Table) {
    log::debug!("command {} started: {}", id, command);
    let (kill_tx, kill_rx) = oneshot::channel();

    let stdin = child.stdin.take().map(|pipe| {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        tokio::spawn(feed_stdin(pipe, stdin_rx));
        stdin_tx
    });

    lock_table(&table).insert(
        id,
        Running {
            stdin,
            kill: Some(kill_tx),
        },
    );

    tokio::spawn(async move {
        let code = supervise(id, child, tx.clone(), kill_rx).await;
        lock_table(&table).remove(&id);
        log::debug!("command {} exited with {}", id, code);
        let _ = tx.send(Response::Exit { id, code }).await;
    });
}

async fn supervise(
    id: CommandId,
    mut child: Child,
    tx: mpsc::Sender<Response>,
    mut kill_rx: oneshot::Receiver<()>,
) -> i32 {
    let stdout = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(forward_lines(id, pipe, tx.clone(), false)));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(forward_lines(id, pipe, tx, true)));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            terminate(&mut child);
            child.wait().await
        }
    };

    for reader in [stdout, stderr].into_iter().flatten() {
        let _ = reader.await;
    }

    match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            log::error!("waiting for command {} failed: {}", id, e);
            -1
        }
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if let Err(e) = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            log::warn!("killpg({}) failed: {}", pid, e);
        }
        return;
    }
    if let Err(e) = child.start_kill() {
        log::warn!("kill failed: {}", e);
    }
}

/// Exit code, or the negated signal number for signalled processes
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}

async fn forward_lines<R>(id: CommandId, pipe: R, tx: mpsc::Sender<Response>, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("command {} pipe read failed: {}", id, e);
                break;
            }
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        let frame = if stderr {
            Response::Stderr { id, line }
        } else {
            Response::Stdout { id, line }
        };
        // waits while the driver is behind
        if tx.send(frame).await.is_err() {
            break;
        }
    }
}

async fn feed_stdin(mut pipe: ChildStdin, mut rx: mpsc::UnboundedReceiver<(String, bool)>) {
    while let Some((data, close)) = rx.recv().await {
        if !data.is_empty() {
            if let Err(e) = pipe.write_all(data.as_bytes()).await {
                log::debug!("stdin write failed: {}", e);
                return;
            }
            let _ = pipe.flush().await;
        }
        if close {
            break;
        }
    }
    // dropping the pipe closes the child's stdin
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;

    async fn agent() -> (SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::bind("127.0.0.1:0", dir.path()).await.unwrap();
        let addr = agent.local_addr().unwrap();
        tokio::spawn(agent.serve());
        (addr, dir)
    }

    async fn send(write: &mut OwnedWriteHalf, request: Request) {
        write
            .write_all(protocol::encode(&request).unwrap().as_bytes())
            .await
            .unwrap();
    }

    /// Frames for `id` up to and including its exit
    async fn collect(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> (Vec<String>, Vec<String>, i32) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            match protocol::decode::<Response>(&line).unwrap() {
                Response::Stdout { line, .. } => out.push(line),
                Response::Stderr { line, .. } => err.push(line),
                Response::Exit { code, .. } => return (out, err, code),
                Response::Error { message, .. } => panic!("spawn failed: {message}"),
            }
        }
    }

    fn spawn_req(id: CommandId, command: &str) -> Request {
        Request::Spawn {
            id,
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_streams_and_exit_code() {
        let (addr, dir) = agent().await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read).lines();

        send(&mut write, spawn_req(1, "echo one; echo two >&2; echo three; pwd; exit 3")).await;
        let (out, err, code) = collect(&mut lines).await;
        assert_eq!(out[..2], ["one", "three"]);
        assert_eq!(out[2], dir.path().canonicalize().unwrap().to_string_lossy());
        assert_eq!(err, ["two"]);
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_stdin_half_close() {
        let (addr, _dir) = agent().await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read).lines();

        send(&mut write, spawn_req(1, "cat")).await;
        send(&mut write, Request::Stdin { id: 1, data: "a\nb\n".into(), close: false }).await;
        send(&mut write, Request::Stdin { id: 1, data: String::new(), close: true }).await;
        let (out, _, code) = collect(&mut lines).await;
        assert_eq!(out, ["a", "b"]);
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let (addr, _dir) = agent().await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read).lines();

        send(&mut write, spawn_req(7, "echo started; sleep 30")).await;
        let first = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(
            protocol::decode::<Response>(&first).unwrap(),
            Response::Stdout { id: 7, .. }
        ));
        send(&mut write, Request::Kill { id: 7 }).await;
        let (_, _, code) = collect(&mut lines).await;
        assert_eq!(code, -9);
    }

    #[tokio::test]
    async fn test_kill_gets_past_stdin_backlog() {
        let (addr, _dir) = agent().await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read).lines();

        // never reads its stdin
        send(&mut write, spawn_req(1, "sleep 30")).await;
        let chunk = "x".repeat(64 * 1024);
        for _ in 0..400 {
            send(&mut write, Request::Stdin { id: 1, data: chunk.clone(), close: false }).await;
        }
        send(&mut write, spawn_req(2, "echo hi")).await;
        send(&mut write, Request::Kill { id: 1 }).await;

        let frames = async {
            let (mut echoed, mut echo_code, mut sleep_code) = (Vec::new(), None, None);
            while echo_code.is_none() || sleep_code.is_none() {
                let line = lines.next_line().await.unwrap().unwrap();
                match protocol::decode::<Response>(&line).unwrap() {
                    Response::Stdout { id: 2, line } => echoed.push(line),
                    Response::Exit { id: 1, code } => sleep_code = Some(code),
                    Response::Exit { id: 2, code } => echo_code = Some(code),
                    other => panic!("unexpected frame {other:?}"),
                }
            }
            (echoed, echo_code, sleep_code)
        };
        let (echoed, echo_code, sleep_code) =
            tokio::time::timeout(Duration::from_secs(10), frames).await.unwrap();
        assert_eq!(echoed, ["hi"]);
        assert_eq!(echo_code, Some(0));
        assert_eq!(sleep_code, Some(-9));
    }

    #[tokio::test]
    async fn test_env_and_bad_cwd() {
        let (addr, _dir) = agent().await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read).lines();

        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        send(
            &mut write,
            Request::Spawn { id: 1, command: "echo $GREETING".into(), cwd: None, env },
        )
        .await;
        let (out, _, _) = collect(&mut lines).await;
        assert_eq!(out, ["hello"]);

        send(
            &mut write,
            Request::Spawn {
                id: 2,
                command: "true".into(),
                cwd: Some("/definitely/not/here".into()),
                env: BTreeMap::new(),
            },
        )
        .await;
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(
            protocol::decode::<Response>(&line).unwrap(),
            Response::Error { id: 2, .. }
        ));
    }

    #[test]
    fn test_resolve_cwd() {
        let base = Path::new("/srv/agent");
        assert_eq!(resolve_cwd(base, None), base);
        assert_eq!(resolve_cwd(base, Some("runs")), base.join("runs"));
        assert_eq!(resolve_cwd(base, Some("/tmp")), Path::new("/tmp"));
    }
}
