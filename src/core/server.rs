//! Servers and server lists - addressable agents plus remote working directories
//!
//! A `Server` is cheap to clone; clones share the working directory and the
//! agent connection, so `cd` through a sub-list is seen by every list holding
//! that server. Changing directories is metadata only; nothing touches the
//! network until the next `run_cmd`.

use super::command::{Command, RunOptions};
use super::connection::AgentConnection;
use super::selector::{resolve_index, Selector};
use crate::error::{DriverError, DriverResult};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Index;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ServerState {
    working_dir: Mutex<Option<String>>,
    connection: tokio::sync::Mutex<Option<Arc<AgentConnection>>>,
}

/// One remote endpoint running an agent
#[derive(Clone)]
pub struct Server {
    id: String,
    host: String,
    port: u16,
    attributes: BTreeMap<String, String>,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            attributes: BTreeMap::new(),
            state: Arc::new(ServerState::default()),
        }
    }

    /// Attach an opaque named attribute (e.g. an InfiniBand address)
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(self, dir: impl Into<String>) -> Self {
        self.cd(dir);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the agent
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Directory for subsequent commands on this server
    pub fn cd(&self, dir: impl Into<String>) {
        let dir = dir.into();
        log::debug!("[{}] cd {}", self.id, dir);
        *self.lock_working_dir() = Some(dir);
    }

    /// Current remote working directory; `None` means the agent's default
    pub fn working_directory(&self) -> Option<String> {
        self.lock_working_dir().clone()
    }

    fn lock_working_dir(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.state
            .working_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// The shared agent connection, opened on first use and reopened if lost
    pub async fn connection(&self) -> DriverResult<Arc<AgentConnection>> {
        let mut slot = self.state.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_lost() {
                return Ok(conn.clone());
            }
            log::warn!("[{}] previous agent connection was lost, reconnecting", self.id);
        }
        let conn = AgentConnection::connect(&self.id, &self.addr()).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run `command` with default options
    pub async fn run_cmd(&self, command: impl Into<String>) -> DriverResult<Command> {
        self.run_cmd_with(command, RunOptions::default()).await
    }

    /// Run `command` in the current working directory
    pub async fn run_cmd_with(
        &self,
        command: impl Into<String>,
        options: RunOptions,
    ) -> DriverResult<Command> {
        Command::spawn(self, command.into(), options).await
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("addr", &self.addr())
            .field("attributes", &self.attributes)
            .field("working_dir", &self.working_directory())
            .finish()
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Ordered collection of servers with unique ids
#[derive(Clone, Default, Debug)]
pub struct ServerList {
    servers: Vec<Server>,
}

impl ServerList {
    /// Build a list, rejecting duplicate ids
    pub fn new<I>(servers: I) -> DriverResult<Self>
    where
        I: IntoIterator<Item = Server>,
    {
        let servers: Vec<Server> = servers.into_iter().collect();
        let mut seen = HashSet::new();
        for server in &servers {
            if !seen.insert(server.id()) {
                return Err(DriverError::Config(format!(
                    "duplicate server id {:?}",
                    server.id()
                )));
            }
        }
        Ok(Self { servers })
    }

    /// An empty list, for experiments that only work locally
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seed the working directory of every member
    pub fn with_working_directory(self, dir: impl Into<String>) -> Self {
        self.cd(dir);
        self
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Server> {
        self.servers.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.servers.iter().map(Server::id).collect()
    }

    /// Server at `index`; negative indices count from the end
    pub fn get(&self, index: isize) -> DriverResult<&Server> {
        Ok(&self.servers[resolve_index(index, self.servers.len())?])
    }

    pub fn by_id(&self, id: &str) -> DriverResult<&Server> {
        self.servers
            .iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| DriverError::UnknownServer(id.to_string()))
    }

    /// Sub-list picked by `selector`, sharing state with this list
    pub fn select(&self, selector: impl Into<Selector>) -> DriverResult<ServerList> {
        let positions = selector.into().resolve(&self.servers)?;
        Ok(Self {
            servers: positions
                .into_iter()
                .map(|i| self.servers[i].clone())
                .collect(),
        })
    }

    /// Change the working directory of every member
    pub fn cd(&self, dir: impl Into<String>) {
        let dir = dir.into();
        for server in &self.servers {
            server.cd(dir.clone());
        }
    }
}

impl Index<usize> for ServerList {
    type Output = Server;

    fn index(&self, index: usize) -> &Server {
        &self.servers[index]
    }
}

impl Index<&str> for ServerList {
    type Output = Server;

    fn index(&self, id: &str) -> &Server {
        match self.servers.iter().find(|s| s.id() == id) {
            Some(server) => server,
            None => panic!("no server with id {:?}", id),
        }
    }
}

impl<'a> IntoIterator for &'a ServerList {
    type Item = &'a Server;
    type IntoIter = std::slice::Iter<'a, Server>;

    fn into_iter(self) -> Self::IntoIter {
        self.servers.iter()
    }
}

impl IntoIterator for ServerList {
    type Item = Server;
    type IntoIter = std::vec::IntoIter<Server>;

    fn into_iter(self) -> Self::IntoIter {
        self.servers.into_iter()
    }
}
