//! SSH sessions backed by the system `ssh` client (openssh multiplexing).
//!
//! Every command is tagged with a unique marker (`chaos-<uuid>` as the
//! shell's `$0`) so that a cancelled command can be killed on the remote
//! side with `pkill -f`.

use crate::config::SshConfig;
use async_trait::async_trait;
use chaos_core::{ChaosError, CommandOutput, Node, Result, RunContext, Session};
use openssh::{KnownHosts, SessionBuilder, Stdio};
use std::borrow::Cow;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

/// Upper bound on the remote kill issued after a cancelled command.
const ABORT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SshSession {
    node: String,
    inner: openssh::Session,
}

impl SshSession {
    pub async fn connect(ctx: &RunContext, node: &Node, config: &SshConfig) -> Result<Self> {
        let mut builder = SessionBuilder::default();
        builder
            .user(config.user.clone())
            .port(config.port)
            .keyfile(&config.key_path)
            .connect_timeout(config.connect_timeout())
            .known_hosts_check(if config.strict_host_keys {
                KnownHosts::Strict
            } else {
                KnownHosts::Accept
            });

        debug!(node = %node.name, host = %node.public_ip, user = %config.user, "ssh connect");
        let inner = ctx
            .run(builder.connect(&node.public_ip))
            .await?
            .map_err(|e| {
                ChaosError::remote(format!(
                    "ssh to {}@{}:{}: {e}",
                    config.user, node.public_ip, config.port
                ))
            })?;
        Ok(Self {
            node: node.name.clone(),
            inner,
        })
    }

    async fn exec(&self, ctx: &RunContext, command: &str, privileged: bool) -> Result<CommandOutput> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let marker = new_marker();
        let remote = wrap_command(command, &marker, privileged);
        debug!(node = %self.node, privileged, %command, "ssh exec");

        let mut cmd = self.inner.raw_command(&remote);
        let outcome = tokio::select! {
            biased;
            out = cmd.output() => Ok(out),
            err = ctx.done() => Err(err),
        };
        match outcome {
            Ok(Ok(output)) => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(ChaosError::remote(format!("{}: {e}", self.node))),
            Err(err) => {
                self.abort(&marker).await;
                Err(err)
            }
        }
    }

    /// Best-effort kill of a command whose caller gave up on it.
    async fn abort(&self, marker: &str) {
        let kill = abort_command(marker);
        let mut cmd = self.inner.raw_command(&kill);
        let result = tokio::time::timeout(ABORT_TIMEOUT, cmd.output()).await;
        match result {
            Ok(Ok(_)) => debug!(node = %self.node, %marker, "remote command killed"),
            Ok(Err(e)) => warn!(node = %self.node, %marker, "remote kill failed: {}", e),
            Err(_) => warn!(node = %self.node, %marker, "remote kill timed out"),
        }
    }
}

#[async_trait]
impl Session for SshSession {
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
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let marker = new_marker();
        let remote = wrap_command(command, &marker, false);
        debug!(node = %self.node, %command, "ssh stream");

        let mut cmd = self.inner.raw_command(&remote);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .await
            .map_err(|e| ChaosError::remote(format!("{}: {e}", self.node)))?;
        let mut child_out = child
            .stdout()
            .take()
            .ok_or_else(|| ChaosError::remote(format!("{}: stdout not captured", self.node)))?;
        let mut child_err = child
            .stderr()
            .take()
            .ok_or_else(|| ChaosError::remote(format!("{}: stderr not captured", self.node)))?;

        let copy = async {
            let (out, err) = tokio::join!(
                tokio::io::copy(&mut child_out, stdout),
                tokio::io::copy(&mut child_err, stderr),
            );
            out.and(err)
        };
        match ctx.run(copy).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(ChaosError::remote(format!("{}: streaming output: {e}", self.node))),
            Err(err) => {
                self.abort(&marker).await;
                return Err(err);
            }
        }

        let status = ctx
            .run(child.wait())
            .await?
            .map_err(|e| ChaosError::remote(format!("{}: {e}", self.node)))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let node = self.node;
        self.inner
            .close()
            .await
            .map_err(|e| ChaosError::remote(format!("closing ssh to {node}: {e}")))
    }
}

fn new_marker() -> String {
    format!("chaos-{}", uuid::Uuid::new_v4())
}

/// `sh -c '<command>' <marker>`, optionally under non-interactive sudo.
fn wrap_command(command: &str, marker: &str, privileged: bool) -> String {
    let script = shell_escape::unix::escape(Cow::Borrowed(command));
    if privileged {
        format!("sudo -n sh -c {script} {marker}")
    } else {
        format!("sh -c {script} {marker}")
    }
}

/// The bracket keeps the pattern from matching the kill command itself.
fn abort_command(marker: &str) -> String {
    let (head, tail) = marker.split_at(1);
    format!("sudo -n pkill -KILL -f '[{head}]{tail}' 2>/dev/null; true")
}
