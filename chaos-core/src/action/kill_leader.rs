use super::{Action, RunState};
use crate::args::Args;
use crate::context::RunContext;
use crate::driver::ClusterView;
use crate::error::{ChaosError, Result};
use crate::registry::Capability;
use async_trait::async_trait;

pub const DEFAULT_SERVICE: &str = "nomad";
const SIGNALS: [&str; 2] = ["TERM", "KILL"];

/// Signals the process of the managed service on the current leader.
///
/// `pkill` exits 1 when nothing matched, which is reported as a failure
/// rather than success so a scenario never silently kills nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillLeaderAction;

impl KillLeaderAction {
    fn signal(args: &Args) -> Result<String> {
        let signal = args.str_or("signal", "TERM")?.to_ascii_uppercase();
        let signal = signal.strip_prefix("SIG").unwrap_or(&signal).to_string();
        if !SIGNALS.contains(&signal.as_str()) {
            return Err(ChaosError::invalid_argument(format!(
                "invalid signal {signal:?}: must be TERM or KILL"
            )));
        }
        Ok(signal)
    }

    fn service(args: &Args) -> Result<String> {
        let service = args.str_or("service", DEFAULT_SERVICE)?;
        let valid = !service.is_empty()
            && service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
        if !valid {
            return Err(ChaosError::invalid_argument(format!(
                "invalid service name {service:?}"
            )));
        }
        Ok(service.to_string())
    }
}

impl Capability for KillLeaderAction {
    fn name(&self) -> &str {
        "kill-leader"
    }

    fn description(&self) -> &str {
        "Kill the Nomad leader process using SIGTERM or SIGKILL"
    }
}

#[async_trait]
impl Action for KillLeaderAction {
    async fn execute(
        &self,
        ctx: &RunContext,
        view: &ClusterView,
        state: &mut RunState,
        args: &Args,
    ) -> Result<()> {
        let signal = Self::signal(args)?;
        let service = Self::service(args)?;

        let leader = view
            .driver
            .resolve_leader(ctx, &view.cluster)
            .await
            .map_err(|e| e.context("finding leader"))?;

        state.set("killed_node", leader.name.clone());
        state.set("killed_address", leader.public_ip.clone());
        state.set("service", service.clone());

        tracing::info!(node = %leader.name, signal = %signal, service = %service, "killing leader");
        let output = view
            .run_privileged_on(ctx, &leader, &format!("pkill -{signal} {service}"))
            .await?;

        match output.exit_code {
            0 => Ok(()),
            1 => Err(ChaosError::remote(format!(
                "no {service} process found on {}",
                leader.name
            ))),
            code => Err(ChaosError::remote(format!(
                "pkill failed (exit {code}): stdout={} stderr={}",
                output.stdout.trim(),
                output.stderr.trim()
            ))),
        }
    }

    async fn rollback(&self, ctx: &RunContext, view: &ClusterView, state: &RunState) -> Result<()> {
        let Some(node_name) = state.get_str("killed_node") else {
            return Ok(());
        };
        let service = state.get_str("service").unwrap_or(DEFAULT_SERVICE);
        let node = view.cluster.server_by_name(node_name)?;

        tracing::info!(node = %node.name, service, "restarting service");
        let output = view
            .run_privileged_on(ctx, node, &format!("systemctl restart {service}"))
            .await?;
        if !output.success() {
            return Err(ChaosError::remote(format!(
                "failed to restart {service} on {} (exit {}): {}",
                node.name,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockApi, MockDriver, MockReply, server_cluster};

    fn setup() -> (MockDriver, ClusterView) {
        let driver = MockDriver::new(server_cluster(3));
        driver.set_leader("server-1");
        let view = driver.view(MockApi::new());
        (driver, view)
    }

    #[tokio::test]
    async fn test_kills_leader_with_default_signal() {
        let (driver, view) = setup();
        let mut state = RunState::new();

        KillLeaderAction
            .execute(&RunContext::background(), &view, &mut state, &Args::new())
            .await
            .unwrap();

        assert_eq!(driver.commands_on("server-1"), vec!["pkill -TERM nomad"]);
        assert!(driver.commands().iter().all(|c| c.privileged));
        assert_eq!(state.get_str("killed_node"), Some("server-1"));
        assert_eq!(state.get_str("killed_address"), Some("192.168.1.11"));
    }

    #[tokio::test]
    async fn test_signal_is_case_insensitive() {
        let (driver, view) = setup();
        let args = Args::new().with("signal", "kill");

        KillLeaderAction
            .execute(&RunContext::background(), &view, &mut RunState::new(), &args)
            .await
            .unwrap();
        assert_eq!(driver.commands_on("server-1"), vec!["pkill -KILL nomad"]);
    }

    #[tokio::test]
    async fn test_rejects_unknown_signal_before_touching_cluster() {
        let (driver, view) = setup();
        let args = Args::new().with("signal", "HUP");

        let err = KillLeaderAction
            .execute(&RunContext::background(), &view, &mut RunState::new(), &args)
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::InvalidArgument(_)));
        assert!(driver.commands().is_empty());
    }

    #[tokio::test]
    async fn test_no_matching_process_is_remote_failure() {
        let (driver, view) = setup();
        driver.respond("pkill", MockReply::exit(1));
        let mut state = RunState::new();

        let err = KillLeaderAction
            .execute(&RunContext::background(), &view, &mut state, &Args::new())
            .await
            .unwrap_err();
        assert_eq!(err, ChaosError::remote("no nomad process found on server-1"));
        // Still recorded so teardown restarts whatever may be left.
        assert_eq!(state.get_str("killed_node"), Some("server-1"));
    }

    #[tokio::test]
    async fn test_missing_leader_is_not_found() {
        let driver = MockDriver::new(server_cluster(3));
        let view = driver.view(MockApi::new());
        let mut state = RunState::new();

        let err = KillLeaderAction
            .execute(&RunContext::background(), &view, &mut state, &Args::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::NotFound(ref m) if m.starts_with("finding leader")));
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restarts_recorded_service() {
        let (driver, view) = setup();
        let mut state = RunState::new();
        state.set("killed_node", "server-2");
        state.set("service", "consul");

        KillLeaderAction
            .rollback(&RunContext::background(), &view, &state)
            .await
            .unwrap();
        assert_eq!(driver.commands_on("server-2"), vec!["systemctl restart consul"]);
    }

    #[tokio::test]
    async fn test_rollback_of_empty_state_is_noop() {
        let (driver, view) = setup();
        KillLeaderAction
            .rollback(&RunContext::background(), &view, &RunState::new())
            .await
            .unwrap();
        assert!(driver.commands().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_reports_restart_failure() {
        let (driver, view) = setup();
        driver.respond("systemctl", MockReply::exit_with_stderr(5, "Unit nomad.service not found."));
        let mut state = RunState::new();
        state.set("killed_node", "server-1");

        let err = KillLeaderAction
            .rollback(&RunContext::background(), &view, &state)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Unit nomad.service not found."));
    }
}
