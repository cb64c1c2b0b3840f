//! Cluster discovery from terraform outputs or a static inventory.

use crate::config::{DiscoveryConfig, DiscoveryMethod, StaticConfig, TerraformConfig};
use chaos_core::{ChaosError, Cluster, Node, NodeRole, Result, RunContext};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct TerraformOutputs {
    server_public_ips: OutputValue<Vec<String>>,
    server_private_ips: OutputValue<Vec<String>>,
    #[serde(default)]
    client_public_ips: Option<OutputValue<Vec<String>>>,
    #[serde(default)]
    client_private_ips: Option<OutputValue<Vec<String>>>,
    #[serde(default)]
    cluster_info: Option<OutputValue<ClusterInfo>>,
}

#[derive(Debug, Deserialize)]
struct OutputValue<T> {
    value: T,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterInfo {
    #[serde(default)]
    stack_name: Option<String>,
}

pub async fn discover(ctx: &RunContext, name: &str, config: &DiscoveryConfig) -> Result<Cluster> {
    let cluster = match config.method {
        DiscoveryMethod::Terraform => discover_terraform(ctx, name, &config.terraform).await?,
        DiscoveryMethod::Static => from_static(name, &config.static_nodes)?,
    };
    info!(
        cluster = %cluster.name,
        servers = cluster.servers.len(),
        clients = cluster.clients.len(),
        "discovered cluster"
    );
    Ok(cluster)
}

async fn discover_terraform(ctx: &RunContext, name: &str, config: &TerraformConfig) -> Result<Cluster> {
    debug!(dir = %config.working_dir.display(), "running {} output -json", config.binary);
    let mut cmd = Command::new(&config.binary);
    cmd.args(["output", "-json"])
        .current_dir(&config.working_dir)
        .kill_on_drop(true);
    let output = ctx
        .run(cmd.output())
        .await?
        .map_err(|e| ChaosError::remote(format!("running {} output: {e}", config.binary)))?;
    if !output.status.success() {
        return Err(ChaosError::remote(format!(
            "{} output failed: {}",
            config.binary,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_terraform_output(name, &String::from_utf8_lossy(&output.stdout))
}

/// Build a cluster from `terraform output -json`.
pub fn parse_terraform_output(name: &str, json: &str) -> Result<Cluster> {
    let outputs: TerraformOutputs = serde_json::from_str(json)
        .map_err(|e| ChaosError::invalid_argument(format!("parsing terraform output: {e}")))?;

    let mut servers = pair_nodes(
        NodeRole::Server,
        outputs.server_public_ips.value,
        outputs.server_private_ips.value,
    )?;
    let mut clients = match (outputs.client_public_ips, outputs.client_private_ips) {
        (Some(public), Some(private)) => pair_nodes(NodeRole::Client, public.value, private.value)?,
        (Some(public), None) => {
            let private = public.value.clone();
            pair_nodes(NodeRole::Client, public.value, private)?
        }
        _ => Vec::new(),
    };

    if let Some(stack) = outputs.cluster_info.and_then(|info| info.value.stack_name) {
        for node in servers.iter_mut().chain(clients.iter_mut()) {
            node.labels.insert("stack".to_string(), stack.clone());
        }
    }
    Cluster::new(name, servers, clients)
}

fn pair_nodes(role: NodeRole, public: Vec<String>, private: Vec<String>) -> Result<Vec<Node>> {
    if public.len() != private.len() {
        return Err(ChaosError::invalid_argument(format!(
            "mismatch between {role} public IPs ({}) and private IPs ({})",
            public.len(),
            private.len()
        )));
    }
    Ok(public
        .into_iter()
        .zip(private)
        .enumerate()
        .map(|(i, (public, private))| Node::new(role, i, public, private))
        .collect())
}

/// Entries are `public` or `public/private`; a bare address is used for both.
pub fn from_static(name: &str, config: &StaticConfig) -> Result<Cluster> {
    let parse = |role: NodeRole, entries: &[String]| -> Result<Vec<Node>> {
        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let (public, private) = entry.split_once('/').unwrap_or((entry, entry));
                let (public, private) = (public.trim(), private.trim());
                if public.is_empty() || private.is_empty() {
                    return Err(ChaosError::invalid_argument(format!(
                        "invalid {role} entry {entry:?}: expected public[/private]"
                    )));
                }
                Ok(Node::new(role, i, public, private))
            })
            .collect()
    };
    Cluster::new(
        name,
        parse(NodeRole::Server, &config.servers)?,
        parse(NodeRole::Client, &config.clients)?,
    )
}
