//! Discovered cluster topology.

use crate::error::{ChaosError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Whether a node runs the server (control plane) or client agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Server,
    Client,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// A single machine under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable name, e.g. `server-0`.
    pub name: String,
    /// Address used for SSH and API access from the operator's machine.
    pub public_ip: String,
    /// Address used for intra-cluster traffic.
    pub private_ip: String,
    pub role: NodeRole,
    /// Dense index within the role, starting at 0.
    pub index: usize,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    pub fn new(
        role: NodeRole,
        index: usize,
        public_ip: impl Into<String>,
        private_ip: impl Into<String>,
    ) -> Self {
        Self {
            name: format!("{role}-{index}"),
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
            role,
            index,
            labels: BTreeMap::new(),
        }
    }
}

/// The set of discovered nodes. Immutable once discovery returns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub servers: Vec<Node>,
    #[serde(default)]
    pub clients: Vec<Node>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, servers: Vec<Node>, clients: Vec<Node>) -> Result<Self> {
        let cluster = Self {
            name: name.into(),
            servers,
            clients,
        };
        cluster.validate()?;
        Ok(cluster)
    }

    /// Names are unique and indices are dense per role.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in self.all_nodes() {
            if !seen.insert(node.name.as_str()) {
                return Err(ChaosError::invalid_argument(format!(
                    "duplicate node name {:?} in cluster {:?}",
                    node.name, self.name
                )));
            }
        }
        for (role, nodes) in [(NodeRole::Server, &self.servers), (NodeRole::Client, &self.clients)] {
            for (expected, node) in nodes.iter().enumerate() {
                if node.role != role || node.index != expected {
                    return Err(ChaosError::invalid_argument(format!(
                        "node {:?} has role {} index {}, expected {} index {}",
                        node.name, node.role, node.index, role, expected
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.servers.iter().chain(self.clients.iter())
    }

    pub fn server_by_index(&self, index: usize) -> Result<&Node> {
        self.servers.get(index).ok_or_else(|| {
            ChaosError::not_found(format!(
                "server index {index} out of range (have {} servers)",
                self.servers.len()
            ))
        })
    }

    pub fn server_by_name(&self, name: &str) -> Result<&Node> {
        self.servers
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| ChaosError::not_found(format!("server {name:?}")))
    }

    pub fn node_by_name(&self, name: &str) -> Result<&Node> {
        self.all_nodes()
            .find(|n| n.name == name)
            .ok_or_else(|| ChaosError::not_found(format!("node {name:?}")))
    }

    /// Find the server whose private address matches `addr` (`ip` or `ip:port`).
    pub fn server_by_private_addr(&self, addr: &str) -> Result<&Node> {
        let ip = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        self.servers
            .iter()
            .find(|n| n.private_ip == ip)
            .ok_or_else(|| ChaosError::not_found(format!("no server with private address {ip}")))
    }
}
