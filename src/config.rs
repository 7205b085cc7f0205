//! Inventory configuration - servers and run policy from YAML

use crate::core::{Server, ServerList};
use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Whether one failed experiment stops the ones queued after it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPolicy {
    pub continue_on_failure: bool,
}

/// One agent endpoint as written in the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Servers plus run-wide defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    /// Applied to every server without its own
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    pub servers: Vec<ServerEntry>,
}

impl Inventory {
    /// Load an inventory from a YAML file
    pub fn from_file(path: &Path) -> DriverResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse an inventory from a YAML string
    pub fn from_yaml(yaml: &str) -> DriverResult<Self> {
        let inventory: Inventory = serde_yaml::from_str(yaml)
            .map_err(|e| DriverError::Config(format!("invalid inventory: {}", e)))?;
        inventory.validate()?;
        Ok(inventory)
    }

    fn validate(&self) -> DriverResult<()> {
        for entry in &self.servers {
            if entry.id.trim().is_empty() {
                return Err(DriverError::Config(format!(
                    "server at {}:{} has an empty id",
                    entry.host, entry.port
                )));
            }
            if entry.host.trim().is_empty() {
                return Err(DriverError::Config(format!(
                    "server {} has an empty host",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    pub fn policy(&self) -> RunPolicy {
        RunPolicy {
            continue_on_failure: self.continue_on_failure,
        }
    }

    /// Build the server list; duplicate ids are rejected here
    pub fn server_list(&self) -> DriverResult<ServerList> {
        let servers = self.servers.iter().map(|entry| {
            let mut server = entry
                .attributes
                .iter()
                .fold(Server::new(&entry.id, &entry.host, entry.port), |s, (k, v)| {
                    s.with_attr(k, v)
                });
            if let Some(dir) = entry
                .working_directory
                .as_ref()
                .or(self.working_directory.as_ref())
            {
                server = server.with_working_directory(dir);
            }
            server
        });
        ServerList::new(servers)
    }
}
