use super::{Action, RunState};
use crate::args::Args;
use crate::cluster::Node;
use crate::context::RunContext;
use crate::driver::{ClusterView, CommandOutput, Session};
use crate::error::{ChaosError, Result};
use crate::registry::Capability;
use async_trait::async_trait;

/// Comment tag on every rule this action installs.
pub const RULE_COMMENT: &str = "chaos-partition";

/// Drops traffic between two servers' private addresses with iptables.
///
/// Each side is marked applied in the run state before its rules go in, and
/// unmarked only once they are confirmed removed. A failed execute removes
/// whatever it managed to install before returning.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionAction;

fn rules(op: char, peer_ip: &str) -> [String; 2] {
    [
        format!("iptables -{op} INPUT -s {peer_ip} -j DROP -m comment --comment {RULE_COMMENT}"),
        format!("iptables -{op} OUTPUT -d {peer_ip} -j DROP -m comment --comment {RULE_COMMENT}"),
    ]
}

async fn add_rules(ctx: &RunContext, session: &dyn Session, peer_ip: &str) -> Result<()> {
    for rule in rules('I', peer_ip) {
        let output = session
            .run_privileged(ctx, &rule)
            .await
            .map_err(|e| e.context(format!("executing {rule:?}")))?;
        if !output.success() {
            return Err(ChaosError::remote(format!(
                "iptables failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
    }
    Ok(())
}

/// iptables exits 1 with "Bad rule (does a matching rule exist in that
/// chain?)" when asked to delete a rule that is not installed.
fn rule_absent(output: &CommandOutput) -> bool {
    output.exit_code == 1
        && (output.stderr.contains("Bad rule") || output.stderr.contains("matching rule exist"))
}

/// Attempts every delete even after one fails; returns the last error.
/// A rule that is already gone counts as removed.
async fn remove_rules(ctx: &RunContext, session: &dyn Session, peer_ip: &str) -> Result<()> {
    let mut last_err = None;
    for rule in rules('D', peer_ip) {
        match session.run_privileged(ctx, &rule).await {
            Ok(output) if output.success() => {}
            Ok(output) if rule_absent(&output) => {
                tracing::debug!(rule = %rule, "rule already absent");
            }
            Ok(output) => {
                last_err = Some(ChaosError::remote(format!(
                    "iptables failed (exit {}): {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
            Err(e) => last_err = Some(e.context(format!("executing {rule:?}"))),
        }
    }
    last_err.map_or(Ok(()), Err)
}

/// Each side and the state key holding its peer's address.
const SIDES: [(&str, &str); 2] = [("source", "target_ip"), ("target", "source_ip")];

fn applied(state: &RunState, side: &str) -> bool {
    state.get_bool(&format!("{side}_applied")) == Some(true)
}

async fn open(ctx: &RunContext, view: &ClusterView, node: &Node) -> Result<Box<dyn Session>> {
    view.driver
        .open_session(ctx, node)
        .await
        .map_err(|e| e.context(format!("connecting to {}", node.name)))
}

async fn close(session: Box<dyn Session>, node: &Node) {
    if let Err(e) = session.close().await {
        tracing::debug!(node = %node.name, "closing session failed: {}", e);
    }
}

impl PartitionAction {
    /// Install the rules on one side. The side is marked applied once a
    /// session is open; a failed install is unwound on the same session.
    async fn apply_side(
        &self,
        ctx: &RunContext,
        view: &ClusterView,
        state: &mut RunState,
        side: &str,
        node: &Node,
        peer_ip: &str,
    ) -> Result<()> {
        let session = open(ctx, view, node).await?;
        state.set(format!("{side}_applied"), true);

        let added = add_rules(ctx, session.as_ref(), peer_ip).await;
        if let Err(e) = added {
            match remove_rules(ctx, session.as_ref(), peer_ip).await {
                Ok(()) => state.set(format!("{side}_applied"), false),
                Err(undo) => {
                    tracing::warn!(node = %node.name, "could not unwind partial rules: {}", undo);
                }
            }
            close(session, node).await;
            return Err(e.context(format!("adding rules on {}", node.name)));
        }

        close(session, node).await;
        tracing::debug!(node = %node.name, peer = peer_ip, "drop rules installed");
        Ok(())
    }

    /// Remove one side's rules while unwinding a failed execute.
    async fn clear_side(
        &self,
        ctx: &RunContext,
        view: &ClusterView,
        state: &mut RunState,
        side: &str,
        node: &Node,
        peer_ip: &str,
    ) {
        let removed = match open(ctx, view, node).await {
            Ok(session) => {
                let removed = remove_rules(ctx, session.as_ref(), peer_ip).await;
                close(session, node).await;
                removed
            }
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => state.set(format!("{side}_applied"), false),
            Err(e) => {
                tracing::warn!(node = %node.name, "could not unwind partial partition: {}", e);
            }
        }
    }

    async fn remove_side(
        &self,
        ctx: &RunContext,
        view: &ClusterView,
        node: &Node,
        peer_ip: &str,
    ) -> Result<()> {
        let session = open(ctx, view, node).await?;
        let removed = remove_rules(ctx, session.as_ref(), peer_ip).await;
        close(session, node).await;
        removed
    }
}

impl Capability for PartitionAction {
    fn name(&self) -> &str {
        "partition"
    }

    fn description(&self) -> &str {
        "Create a network partition between two nodes using iptables DROP rules"
    }
}

#[async_trait]
impl Action for PartitionAction {
    async fn execute(
        &self,
        ctx: &RunContext,
        view: &ClusterView,
        state: &mut RunState,
        args: &Args,
    ) -> Result<()> {
        let source_name = args.require_str("source")?;
        let target_name = args.require_str("target")?;
        let bidirectional = args.bool_or("bidirectional", true)?;
        if source_name == target_name {
            return Err(ChaosError::invalid_argument(format!(
                "source and target are both {source_name:?}"
            )));
        }

        let source = view
            .cluster
            .server_by_name(source_name)
            .map_err(|e| e.context("finding source node"))?;
        let target = view
            .cluster
            .server_by_name(target_name)
            .map_err(|e| e.context("finding target node"))?;

        state.set("source_node", source.name.clone());
        state.set("target_node", target.name.clone());
        state.set("source_ip", source.private_ip.clone());
        state.set("target_ip", target.private_ip.clone());
        state.set("bidirectional", bidirectional);

        tracing::info!(
            source = %source.name,
            target = %target.name,
            bidirectional,
            "partitioning"
        );

        self.apply_side(ctx, view, state, "source", source, &target.private_ip)
            .await?;

        if bidirectional {
            if let Err(e) = self
                .apply_side(ctx, view, state, "target", target, &source.private_ip)
                .await
            {
                self.clear_side(ctx, view, state, "source", source, &target.private_ip)
                    .await;
                return Err(e);
            }
        }
        Ok(())
    }

    fn needs_rollback(&self, state: &RunState) -> bool {
        SIDES.iter().any(|(side, _)| applied(state, side))
    }

    async fn rollback(&self, ctx: &RunContext, view: &ClusterView, state: &RunState) -> Result<()> {
        let mut last_err = None;
        for (side, peer_key) in SIDES {
            if !applied(state, side) {
                continue;
            }
            let located = state
                .require_str(&format!("{side}_node"))
                .and_then(|name| view.cluster.server_by_name(name))
                .and_then(|node| state.require_str(peer_key).map(|ip| (node, ip)));
            let (node, peer_ip) = match located {
                Ok(found) => found,
                Err(e) => {
                    last_err = Some(e.context(format!("locating {side} side")));
                    continue;
                }
            };

            if let Err(e) = self.remove_side(ctx, view, node, peer_ip).await {
                last_err = Some(e.context(format!("removing rules on {}", node.name)));
            }
        }
        last_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockApi, MockDriver, MockReply, server_cluster};

    fn setup() -> (MockDriver, ClusterView) {
        let driver = MockDriver::new(server_cluster(3));
        let view = driver.view(MockApi::new());
        (driver, view)
    }

    fn args(source: &str, target: &str) -> Args {
        Args::new().with("source", source).with("target", target)
    }

    #[tokio::test]
    async fn test_bidirectional_partition_installs_rules_on_both_sides() {
        let (driver, view) = setup();
        let mut state = RunState::new();

        PartitionAction
            .execute(&RunContext::background(), &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap();

        assert_eq!(
            driver.rules_on("server-0"),
            vec![
                "INPUT -s 10.0.0.11 -j DROP -m comment --comment chaos-partition",
                "OUTPUT -d 10.0.0.11 -j DROP -m comment --comment chaos-partition",
            ]
        );
        assert_eq!(driver.rules_on("server-1").len(), 2);
        assert_eq!(state.get_str("source_ip"), Some("10.0.0.10"));
        assert_eq!(state.get_bool("target_applied"), Some(true));

        PartitionAction
            .rollback(&RunContext::background(), &view, &state)
            .await
            .unwrap();
        assert!(driver.rules_on("server-0").is_empty());
        assert!(driver.rules_on("server-1").is_empty());
    }

    #[tokio::test]
    async fn test_unidirectional_partition_touches_only_source() {
        let (driver, view) = setup();
        let mut state = RunState::new();

        PartitionAction
            .execute(
                &RunContext::background(),
                &view,
                &mut state,
                &args("server-0", "server-2").with("bidirectional", false),
            )
            .await
            .unwrap();

        assert_eq!(driver.rules_on("server-0").len(), 2);
        assert!(driver.commands_on("server-2").is_empty());
        assert_eq!(state.get("target_applied"), None);
    }

    #[tokio::test]
    async fn test_target_failure_leaves_no_rules_on_source() {
        let (driver, view) = setup();
        driver.respond_on(
            "server-1",
            "iptables -I",
            MockReply::exit_with_stderr(4, "iptables: Resource temporarily unavailable."),
        );
        let mut state = RunState::new();

        let err = PartitionAction
            .execute(&RunContext::background(), &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("adding rules on server-1"));
        assert!(driver.rules_on("server-0").is_empty());
        assert!(driver.rules_on("server-1").is_empty());
        assert_eq!(state.get_bool("source_applied"), Some(false));
        assert_eq!(state.get_bool("target_applied"), Some(false));
        assert!(!state.is_empty());
        assert!(!PartitionAction.needs_rollback(&state));

        // Nothing left for teardown to do.
        let before = driver.commands().len();
        PartitionAction
            .rollback(&RunContext::background(), &view, &state)
            .await
            .unwrap();
        assert_eq!(driver.commands().len(), before);
    }

    #[tokio::test]
    async fn test_second_source_rule_failure_unwinds_first() {
        let (driver, view) = setup();
        driver.respond_on("server-0", "iptables -I OUTPUT", MockReply::exit(1));
        let mut state = RunState::new();

        PartitionAction
            .execute(&RunContext::background(), &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap_err();

        assert!(driver.rules_on("server-0").is_empty());
        assert!(driver.commands_on("server-1").is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_target_node() {
        let (driver, view) = setup();
        driver.set_unreachable("server-1");
        let mut state = RunState::new();

        let err = PartitionAction
            .execute(&RunContext::background(), &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::RemoteFailure(_)));
        assert!(driver.rules_on("server-0").is_empty());
    }

    #[tokio::test]
    async fn test_argument_errors() {
        let (driver, view) = setup();
        let ctx = RunContext::background();

        let missing = PartitionAction
            .execute(&ctx, &view, &mut RunState::new(), &Args::new().with("source", "server-0"))
            .await
            .unwrap_err();
        assert_eq!(missing, ChaosError::invalid_argument("target is required"));

        let unknown = PartitionAction
            .execute(&ctx, &view, &mut RunState::new(), &args("server-0", "server-7"))
            .await
            .unwrap_err();
        assert!(matches!(unknown, ChaosError::NotFound(_)));

        let same = PartitionAction
            .execute(&ctx, &view, &mut RunState::new(), &args("server-1", "server-1"))
            .await
            .unwrap_err();
        assert!(matches!(same, ChaosError::InvalidArgument(_)));
        assert!(driver.commands().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_keeps_going_after_one_side_fails() {
        let (driver, view) = setup();
        let mut state = RunState::new();
        PartitionAction
            .execute(&RunContext::background(), &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap();

        driver.set_unreachable("server-0");
        let err = PartitionAction
            .rollback(&RunContext::background(), &view, &state)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("removing rules on server-0"));
        assert!(driver.rules_on("server-1").is_empty());
    }

    #[tokio::test]
    async fn test_rollback_twice_is_clean() {
        let (driver, view) = setup();
        let mut state = RunState::new();
        let ctx = RunContext::background();
        PartitionAction
            .execute(&ctx, &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap();

        PartitionAction.rollback(&ctx, &view, &state).await.unwrap();
        // Every delete now answers "Bad rule"; the rules are already gone.
        PartitionAction.rollback(&ctx, &view, &state).await.unwrap();
        assert!(driver.rules_on("server-0").is_empty());
        assert!(driver.rules_on("server-1").is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_side_applied() {
        let (driver, view) = setup();
        driver.respond_on(
            "server-1",
            "iptables -I",
            MockReply::exit_with_stderr(4, "iptables: Resource temporarily unavailable."),
        );
        driver.respond_on(
            "server-1",
            "iptables -D",
            MockReply::exit_with_stderr(4, "iptables: Resource temporarily unavailable."),
        );
        let mut state = RunState::new();

        PartitionAction
            .execute(&RunContext::background(), &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap_err();

        assert_eq!(state.get_bool("source_applied"), Some(false));
        assert_eq!(state.get_bool("target_applied"), Some(true));
        assert!(PartitionAction.needs_rollback(&state));
    }

    #[tokio::test]
    async fn test_rollback_tries_target_when_source_is_unknown() {
        let (driver, view) = setup();
        let mut state = RunState::new();
        PartitionAction
            .execute(&RunContext::background(), &view, &mut state, &args("server-0", "server-1"))
            .await
            .unwrap();

        state.set("source_node", "server-9");
        let err = PartitionAction
            .rollback(&RunContext::background(), &view, &state)
            .await
            .unwrap_err();

        assert!(matches!(err, ChaosError::NotFound(_)), "{err}");
        assert!(err.to_string().contains("locating source side"), "{err}");
        assert!(driver.rules_on("server-1").is_empty());
        assert_eq!(driver.rules_on("server-0").len(), 2);
    }
}
