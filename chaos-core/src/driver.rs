//! Collaborator contracts: discovery, remote sessions and cluster API probes.
//!
//! The engine only talks to the cluster through these traits. Concrete
//! implementations (terraform discovery, openssh sessions, the HTTP API
//! client) live in the CLI crate; in-memory fakes live in [`crate::mock`].

use crate::cluster::{Cluster, Node};
use crate::context::RunContext;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Remote exit status; -1 when the process was terminated by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote control channel to one node.
#[async_trait]
pub trait Session: Send + Sync {
    /// Run a command and capture its output. A non-zero exit code is not an
    /// error at this layer; callers interpret it.
    async fn run(&self, ctx: &RunContext, command: &str) -> Result<CommandOutput>;

    /// Run a command with elevated privilege.
    async fn run_privileged(&self, ctx: &RunContext, command: &str) -> Result<CommandOutput>;

    /// Run a command, streaming its output into the given sinks.
    async fn stream(
        &self,
        ctx: &RunContext,
        command: &str,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Node discovery and session factory.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn discover(&self, ctx: &RunContext) -> Result<Cluster>;

    async fn open_session(&self, ctx: &RunContext, node: &Node) -> Result<Box<dyn Session>>;

    /// The node currently holding cluster leadership.
    async fn resolve_leader(&self, ctx: &RunContext, cluster: &Cluster) -> Result<Node>;

    /// Base URL of the node's control-plane API.
    fn control_address(&self, node: &Node) -> String;

    async fn close(&self) -> Result<()>;
}

/// Read-only probes against a node's control-plane API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Leader address as reported by `node`; empty when no leader is known.
    async fn leader(&self, ctx: &RunContext, node: &Node) -> Result<String>;

    /// Whether `node` reports itself healthy.
    async fn healthy(&self, ctx: &RunContext, node: &Node) -> Result<bool>;
}

/// Everything a capability may use to reach the cluster under test.
#[derive(Clone)]
pub struct ClusterView {
    pub cluster: Arc<Cluster>,
    pub driver: Arc<dyn Driver>,
    pub api: Arc<dyn ClusterApi>,
}

impl ClusterView {
    pub fn new(cluster: Arc<Cluster>, driver: Arc<dyn Driver>, api: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            driver,
            api,
        }
    }

    /// Open a session to `node`, run one privileged command, close the session.
    pub async fn run_privileged_on(
        &self,
        ctx: &RunContext,
        node: &Node,
        command: &str,
    ) -> Result<CommandOutput> {
        let session = self
            .driver
            .open_session(ctx, node)
            .await
            .map_err(|e| e.context(format!("connecting to {}", node.name)))?;
        let output = session.run_privileged(ctx, command).await;
        if let Err(e) = session.close().await {
            tracing::debug!(node = %node.name, "closing session failed: {}", e);
        }
        output
    }
}

impl std::fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterView")
            .field("cluster", &self.cluster.name)
            .field("servers", &self.cluster.servers.len())
            .finish()
    }
}
