//! Production driver: configured discovery, SSH sessions and API-based
//! leader resolution.

use crate::api::{self, NomadApi};
use crate::config::Config;
use crate::discovery;
use async_trait::async_trait;
use chaos_core::{ChaosError, Cluster, ClusterApi, Driver, Node, Result, RunContext, Session};
use std::sync::Arc;
use tracing::debug;

pub struct NomadDriver {
    config: Arc<Config>,
    api: Arc<NomadApi>,
}

impl NomadDriver {
    pub fn new(config: Arc<Config>, api: Arc<NomadApi>) -> Self {
        Self { config, api }
    }
}

#[async_trait]
impl Driver for NomadDriver {
    async fn discover(&self, ctx: &RunContext) -> Result<Cluster> {
        discovery::discover(ctx, &self.config.cluster.name, &self.config.discovery).await
    }

    #[cfg(unix)]
    async fn open_session(&self, ctx: &RunContext, node: &Node) -> Result<Box<dyn Session>> {
        let session = crate::ssh::SshSession::connect(ctx, node, &self.config.ssh).await?;
        Ok(Box::new(session))
    }

    #[cfg(not(unix))]
    async fn open_session(&self, _ctx: &RunContext, node: &Node) -> Result<Box<dyn Session>> {
        Err(ChaosError::remote(format!(
            "cannot reach {}: ssh sessions require a unix host",
            node.name
        )))
    }

    async fn resolve_leader(&self, ctx: &RunContext, cluster: &Cluster) -> Result<Node> {
        resolve_leader_via(self.api.as_ref(), ctx, cluster).await
    }

    fn control_address(&self, node: &Node) -> String {
        api::base_url(&self.config.api, node)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Ask each server in turn who the leader is and map the answer back to a
/// server by private address.
pub async fn resolve_leader_via(api: &dyn ClusterApi, ctx: &RunContext, cluster: &Cluster) -> Result<Node> {
    let mut last_err = None;
    for server in &cluster.servers {
        match api.leader(ctx, server).await {
            Ok(addr) if !addr.is_empty() => {
                debug!(server = %server.name, leader = %addr, "leader reported");
                return cluster.server_by_private_addr(&addr).cloned().map_err(|_| {
                    ChaosError::not_found(format!("leader IP {addr} not found in cluster nodes"))
                });
            }
            Ok(_) => debug!(server = %server.name, "no leader reported"),
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                debug!(server = %server.name, "leader query failed: {}", e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => e.context("could not determine leader"),
        None => ChaosError::not_found("could not determine leader"),
    })
}
