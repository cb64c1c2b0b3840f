use super::{Assertion, CheckResult};
use crate::args::Args;
use crate::context::RunContext;
use crate::driver::ClusterView;
use crate::error::{ChaosError, Result};
use crate::registry::Capability;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_WITHIN: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL: Duration = Duration::from_secs(1);

/// Polls every server's leader endpoint until one names a leader.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaderElectedAssertion;

impl Capability for LeaderElectedAssertion {
    fn name(&self) -> &str {
        "leader-elected"
    }

    fn description(&self) -> &str {
        "Verify that a Nomad leader is elected within the specified timeout"
    }
}

#[async_trait]
impl Assertion for LeaderElectedAssertion {
    async fn check(&self, ctx: &RunContext, view: &ClusterView, args: &Args) -> Result<CheckResult> {
        let within = args.duration_or("within", DEFAULT_WITHIN)?;
        let poll = args.duration_or("poll", DEFAULT_POLL)?;
        if poll.is_zero() {
            return Err(ChaosError::invalid_argument("poll must be greater than zero"));
        }

        let mut result = CheckResult::new(self.name());
        result.detail("timeout", humantime::format_duration(within).to_string());
        result.detail("poll_interval", humantime::format_duration(poll).to_string());

        let started = Instant::now();
        let bounded = ctx.with_timeout(within);
        let mut rounds = 0;

        'poll: while bounded.err().is_none() {
            rounds += 1;
            for server in &view.cluster.servers {
                match view.api.leader(&bounded, server).await {
                    Ok(leader) if !leader.is_empty() => {
                        tracing::debug!(server = %server.name, leader = %leader, rounds, "leader found");
                        result.success = true;
                        result.message = format!("leader elected: {leader}");
                        result.detail("responding_server", server.name.clone());
                        result.detail("leader", leader);
                        result.attempts = rounds;
                        result.duration = started.elapsed();
                        return Ok(result);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(err) = ctx.err() {
                            return Err(err);
                        }
                        if bounded.err().is_some() {
                            break 'poll;
                        }
                        tracing::debug!(server = %server.name, "leader query failed: {}", e);
                    }
                }
            }

            if bounded.sleep(poll).await.is_err() {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                break;
            }
        }

        if let Some(err) = ctx.err() {
            return Err(err);
        }
        result.attempts = rounds;
        result.duration = started.elapsed();
        result.message = format!(
            "no leader elected within {} after {rounds} attempts",
            humantime::format_duration(within)
        );
        Ok(result)
    }
}
