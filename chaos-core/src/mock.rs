//! In-memory collaborators for tests and dry runs.
//!
//! [`MockDriver`] hands out [`MockSession`]s that never touch the network.
//! Every command is recorded, canned responses can be scripted per node, and
//! `iptables -I/-D` commands are tracked so tests can assert which drop rules
//! are left behind. [`MockApi`] answers leader and health probes from tables.

use crate::cluster::{Cluster, Node, NodeRole};
use crate::context::RunContext;
use crate::driver::{ClusterApi, ClusterView, CommandOutput, Driver, Session};
use crate::error::{ChaosError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Build a cluster of `n` servers named `server-<i>` with
/// public `192.168.1.<10+i>` and private `10.0.0.<10+i>` addresses.
pub fn server_cluster(n: usize) -> Cluster {
    let servers = (0..n)
        .map(|i| {
            Node::new(
                NodeRole::Server,
                i,
                format!("192.168.1.{}", 10 + i),
                format!("10.0.0.{}", 10 + i),
            )
        })
        .collect();
    Cluster {
        name: "mock".to_string(),
        servers,
        clients: Vec::new(),
    }
}

/// One command seen by a mock session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub node: String,
    pub command: String,
    pub privileged: bool,
}

/// What a scripted command should do.
#[derive(Debug, Clone)]
pub enum MockReply {
    Exit { code: i32, stdout: String, stderr: String },
    Fail(ChaosError),
    /// Block until the caller's context is done.
    Hang,
}

impl MockReply {
    pub fn exit(code: i32) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn exit_with_stderr(code: i32, stderr: impl Into<String>) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug)]
struct Rule {
    node: Option<String>,
    pattern: String,
    reply: MockReply,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct DriverState {
    rules: Vec<Rule>,
    log: Vec<CommandRecord>,
    firewall: HashMap<String, BTreeSet<String>>,
    unreachable: BTreeSet<String>,
    leader: Option<String>,
    sessions_opened: usize,
}

/// Scriptable [`Driver`] over a fixed cluster.
#[derive(Debug, Clone)]
pub struct MockDriver {
    cluster: Cluster,
    state: Arc<Mutex<DriverState>>,
}

impl MockDriver {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            state: Arc::new(Mutex::new(DriverState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Node that `resolve_leader` reports.
    pub fn set_leader(&self, node: &str) {
        self.lock().leader = Some(node.to_string());
    }

    /// Reply to every command containing `pattern`, on any node.
    pub fn respond(&self, pattern: &str, reply: MockReply) {
        self.push_rule(None, pattern, reply, None);
    }

    /// Reply to commands containing `pattern` on `node` only.
    pub fn respond_on(&self, node: &str, pattern: &str, reply: MockReply) {
        self.push_rule(Some(node), pattern, reply, None);
    }

    /// Reply only to the next `times` matching commands on `node`.
    pub fn respond_on_times(&self, node: &str, pattern: &str, reply: MockReply, times: usize) {
        self.push_rule(Some(node), pattern, reply, Some(times));
    }

    fn push_rule(&self, node: Option<&str>, pattern: &str, reply: MockReply, remaining: Option<usize>) {
        self.lock().rules.push(Rule {
            node: node.map(str::to_string),
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
    }

    /// Make `open_session` fail for `node`.
    pub fn set_unreachable(&self, node: &str) {
        self.lock().unreachable.insert(node.to_string());
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.lock().log.clone()
    }

    pub fn commands_on(&self, node: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.node == node)
            .map(|r| r.command.clone())
            .collect()
    }

    /// Drop rules currently installed on `node`.
    pub fn rules_on(&self, node: &str) -> Vec<String> {
        self.lock()
            .firewall
            .get(node)
            .map(|rules| rules.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Wrap this driver and `api` into a view over the driver's cluster.
    pub fn view(&self, api: MockApi) -> ClusterView {
        ClusterView::new(
            Arc::new(self.cluster.clone()),
            Arc::new(self.clone()),
            Arc::new(api),
        )
    }

    fn reply_for(&self, node: &str, command: &str, privileged: bool) -> MockReply {
        let mut state = self.lock();
        state.log.push(CommandRecord {
            node: node.to_string(),
            command: command.to_string(),
            privileged,
        });

        let matched = state.rules.iter_mut().rev().find(|rule| {
            rule.node.as_deref().is_none_or(|n| n == node)
                && command.contains(&rule.pattern)
                && rule.remaining != Some(0)
        });
        let reply = match matched {
            Some(rule) => {
                if let Some(left) = rule.remaining.as_mut() {
                    *left -= 1;
                }
                rule.reply.clone()
            }
            None => MockReply::exit(0),
        };

        if let MockReply::Exit { code: 0, .. } = reply {
            if !track_firewall(&mut state.firewall, node, command) {
                return MockReply::exit_with_stderr(1, BAD_RULE);
            }
        }
        reply
    }
}

/// What iptables prints when deleting a rule that is not installed.
pub const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

/// Returns false for a delete of a rule the node does not hold.
fn track_firewall(firewall: &mut HashMap<String, BTreeSet<String>>, node: &str, command: &str) -> bool {
    if let Some(rule) = command.strip_prefix("iptables -I ") {
        firewall
            .entry(node.to_string())
            .or_default()
            .insert(rule.to_string());
    } else if let Some(rule) = command.strip_prefix("iptables -D ") {
        return firewall.get_mut(node).is_some_and(|rules| rules.remove(rule));
    }
    true
}

#[async_trait]
impl Driver for MockDriver {
    async fn discover(&self, _ctx: &RunContext) -> Result<Cluster> {
        Ok(self.cluster.clone())
    }

    async fn open_session(&self, ctx: &RunContext, node: &Node) -> Result<Box<dyn Session>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let mut state = self.lock();
        if state.unreachable.contains(&node.name) {
            return Err(ChaosError::remote(format!(
                "connection to {} refused",
                node.public_ip
            )));
        }
        state.sessions_opened += 1;
        Ok(Box::new(MockSession {
            node: node.name.clone(),
            driver: self.clone(),
        }))
    }

    async fn resolve_leader(&self, _ctx: &RunContext, cluster: &Cluster) -> Result<Node> {
        let leader = self.lock().leader.clone();
        match leader {
            Some(name) => cluster.server_by_name(&name).cloned(),
            None => Err(ChaosError::not_found("no leader elected")),
        }
    }

    fn control_address(&self, node: &Node) -> String {
        format!("http://{}:4646", node.public_ip)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Session handed out by [`MockDriver`].
pub struct MockSession {
    node: String,
    driver: MockDriver,
}

impl MockSession {
    async fn exec(&self, ctx: &RunContext, command: &str, privileged: bool) -> Result<CommandOutput> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        match self.driver.reply_for(&self.node, command, privileged) {
            MockReply::Exit { code, stdout, stderr } => Ok(CommandOutput {
                stdout,
                stderr,
                exit_code: code,
            }),
            MockReply::Fail(err) => Err(err),
            MockReply::Hang => Err(ctx.done().await),
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn run(&self, ctx: &RunContext, command: &str) -> Result<CommandOutput> {
        self.exec(ctx, command, false).await
    }

    async fn run_privileged(&self, ctx: &RunContext, command: &str) -> Result<CommandOutput> {
        self.exec(ctx, command, true).await
    }

    async fn stream(
        &self,
        ctx: &RunContext,
        command: &str,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32> {
        let output = self.exec(ctx, command, false).await?;
        let write = |e: std::io::Error| ChaosError::remote(format!("writing output: {e}"));
        stdout.write_all(output.stdout.as_bytes()).await.map_err(write)?;
        stderr.write_all(output.stderr.as_bytes()).await.map_err(write)?;
        Ok(output.exit_code)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ApiState {
    leaders: HashMap<String, Result<String>>,
    health: HashMap<String, Result<bool>>,
    delays: HashMap<String, Duration>,
    /// Leader answers that switch on after this many leader probes.
    leader_after: Option<(usize, String, String)>,
    leader_probes: usize,
    health_probes: usize,
}

/// Table-driven [`ClusterApi`]. Unknown nodes report no leader and healthy.
#[derive(Debug, Clone, Default)]
pub struct MockApi {
    state: Arc<Mutex<ApiState>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_leader(self, node: &str, leader: &str) -> Self {
        self.lock()
            .leaders
            .insert(node.to_string(), Ok(leader.to_string()));
        self
    }

    pub fn with_leader_error(self, node: &str, err: ChaosError) -> Self {
        self.lock().leaders.insert(node.to_string(), Err(err));
        self
    }

    /// `node` starts reporting `leader` once `probes` leader probes have been made.
    pub fn with_leader_after(self, probes: usize, node: &str, leader: &str) -> Self {
        self.lock().leader_after = Some((probes, node.to_string(), leader.to_string()));
        self
    }

    pub fn with_health(self, node: &str, healthy: bool) -> Self {
        self.lock().health.insert(node.to_string(), Ok(healthy));
        self
    }

    pub fn with_health_error(self, node: &str, err: ChaosError) -> Self {
        self.lock().health.insert(node.to_string(), Err(err));
        self
    }

    /// Delay every probe against `node`.
    pub fn with_delay(self, node: &str, delay: Duration) -> Self {
        self.lock().delays.insert(node.to_string(), delay);
        self
    }

    pub fn leader_probes(&self) -> usize {
        self.lock().leader_probes
    }

    pub fn health_probes(&self) -> usize {
        self.lock().health_probes
    }

    async fn delay(&self, ctx: &RunContext, node: &Node) -> Result<()> {
        let delay = self.lock().delays.get(&node.name).copied();
        match delay {
            Some(delay) => ctx.sleep(delay).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterApi for MockApi {
    async fn leader(&self, ctx: &RunContext, node: &Node) -> Result<String> {
        self.delay(ctx, node).await?;
        let mut state = self.lock();
        state.leader_probes += 1;
        if let Some((after, who, leader)) = state.leader_after.clone() {
            if state.leader_probes > after && who == node.name {
                return Ok(leader);
            }
        }
        state
            .leaders
            .get(&node.name)
            .cloned()
            .unwrap_or_else(|| Ok(String::new()))
    }

    async fn healthy(&self, ctx: &RunContext, node: &Node) -> Result<bool> {
        self.delay(ctx, node).await?;
        let mut state = self.lock();
        state.health_probes += 1;
        state.health.get(&node.name).cloned().unwrap_or(Ok(true))
    }
}
