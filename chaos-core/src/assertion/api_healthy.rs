use super::{Assertion, CheckResult};
use crate::args::Args;
use crate::context::RunContext;
use crate::driver::ClusterView;
use crate::error::{ChaosError, Result};
use crate::registry::Capability;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest majority of `servers`.
pub fn quorum(servers: usize) -> usize {
    servers / 2 + 1
}

/// Probes every server's health endpoint in parallel and requires a quorum.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiHealthyAssertion;

enum Probe {
    Healthy,
    Unhealthy,
    Failed(ChaosError),
}

impl Probe {
    fn status(&self) -> String {
        match self {
            Self::Healthy => "healthy".to_string(),
            Self::Unhealthy => "unhealthy".to_string(),
            Self::Failed(e) => format!("error: {e}"),
        }
    }
}

impl Capability for ApiHealthyAssertion {
    fn name(&self) -> &str {
        "nomad-api-healthy"
    }

    fn description(&self) -> &str {
        "Verify that a quorum of Nomad servers respond to API health checks"
    }
}

#[async_trait]
impl Assertion for ApiHealthyAssertion {
    async fn check(&self, ctx: &RunContext, view: &ClusterView, args: &Args) -> Result<CheckResult> {
        let timeout = args.duration_or("timeout", DEFAULT_CHECK_TIMEOUT)?;
        let total = view.cluster.servers.len();
        let min_healthy = args.int_or("min_healthy", quorum(total) as i64)?;
        if min_healthy < 1 {
            return Err(ChaosError::invalid_argument(format!(
                "min_healthy must be at least 1, got {min_healthy}"
            )));
        }

        let mut result = CheckResult::new(self.name());
        result.detail("total_servers", total);
        result.detail("min_healthy", min_healthy);
        result.detail("timeout", humantime::format_duration(timeout).to_string());

        let started = Instant::now();
        let mut probes = JoinSet::new();
        for server in view.cluster.servers.iter().cloned() {
            let api = view.api.clone();
            let probe_ctx = ctx.with_timeout(timeout);
            probes.spawn(async move {
                let outcome = match probe_ctx.run(api.healthy(&probe_ctx, &server)).await {
                    Ok(Ok(true)) => Probe::Healthy,
                    Ok(Ok(false)) => Probe::Unhealthy,
                    Ok(Err(e)) | Err(e) => Probe::Failed(e),
                };
                (server.name, outcome)
            });
        }

        // Every probe finishes or times out before the aggregate is computed.
        let mut statuses = Map::new();
        let mut healthy = 0usize;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    if matches!(outcome, Probe::Healthy) {
                        healthy += 1;
                    }
                    tracing::debug!(server = %name, status = %outcome.status(), "health probe");
                    statuses.insert(name, Value::String(outcome.status()));
                }
                Err(e) => tracing::warn!("health probe task failed: {}", e),
            }
        }

        if ctx.is_cancelled() {
            return Err(ChaosError::Cancelled);
        }

        result.detail("healthy_count", healthy);
        result.detail("server_statuses", Value::Object(statuses));
        result.duration = started.elapsed();
        result.attempts = 1;

        if healthy as i64 >= min_healthy {
            result.success = true;
            result.message = format!("{healthy}/{total} servers healthy (quorum: {min_healthy})");
        } else {
            result.message =
                format!("only {healthy}/{total} servers healthy (need {min_healthy} for quorum)");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockApi, MockDriver, server_cluster};

    fn five_servers(healthy: usize) -> MockApi {
        (0..5).fold(MockApi::new(), |api, i| {
            api.with_health(&format!("server-{i}"), i < healthy)
        })
    }

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[tokio::test]
    async fn test_three_of_five_meets_default_quorum() {
        let view = MockDriver::new(server_cluster(5)).view(five_servers(3));

        let result = ApiHealthyAssertion
            .check(&RunContext::background(), &view, &Args::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.details["healthy_count"], 3);
        assert_eq!(result.details["min_healthy"], 3);
        assert_eq!(result.details["total_servers"], 5);
        assert_eq!(result.details["server_statuses"]["server-4"], "unhealthy");
        assert_eq!(result.message, "3/5 servers healthy (quorum: 3)");
    }

    #[tokio::test]
    async fn test_two_of_five_fails_default_quorum() {
        let view = MockDriver::new(server_cluster(5)).view(five_servers(2));

        let result = ApiHealthyAssertion
            .check(&RunContext::background(), &view, &Args::new())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.details["healthy_count"], 2);
        assert_eq!(result.details["server_statuses"].as_object().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_min_healthy_override() {
        let view = MockDriver::new(server_cluster(5)).view(five_servers(2));
        let args = Args::new().with("min_healthy", 2i64);

        let result = ApiHealthyAssertion
            .check(&RunContext::background(), &view, &args)
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_server_times_out_without_blocking_the_rest() {
        let api = MockApi::new()
            .with_delay("server-0", Duration::from_secs(60))
            .with_health_error("server-1", ChaosError::remote("connection refused"));
        let view = MockDriver::new(server_cluster(3)).view(api);
        let args = Args::new().with("timeout", Duration::from_secs(2));

        let started = Instant::now();
        let result = ApiHealthyAssertion
            .check(&RunContext::background(), &view, &args)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!result.success);
        let statuses = &result.details["server_statuses"];
        assert_eq!(statuses["server-0"], "error: timed out: deadline exceeded");
        assert_eq!(statuses["server-1"], "error: remote failure: connection refused");
        assert_eq!(statuses["server-2"], "healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_check_is_an_error() {
        let api = (0..3).fold(MockApi::new(), |api, i| {
            api.with_delay(&format!("server-{i}"), Duration::from_secs(5))
        });
        let view = MockDriver::new(server_cluster(3)).view(api);
        let (ctx, handle) = RunContext::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });

        let err = ApiHealthyAssertion
            .check(&ctx, &view, &Args::new())
            .await
            .unwrap_err();
        assert_eq!(err, ChaosError::Cancelled);
    }
}
