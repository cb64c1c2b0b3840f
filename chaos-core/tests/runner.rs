mod common;

use chaos_core::mock::{MockApi, MockReply};
use chaos_core::{
    ActionRegistry, Args, Capability, ChaosError, EventType, OnError, RunContext, Scenario, Step,
};
use common::{Harness, tag};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn record(name: &str, tag_name: &str) -> Step {
    Step::action(name, "record").with_args(tag(tag_name))
}

fn failing(name: &str, tag_name: &str) -> Step {
    Step::action(name, "record").with_args(tag(tag_name).with("fail", true))
}

#[tokio::test]
async fn test_clean_run_succeeds_with_no_failed_steps() {
    let h = Harness::new(3, MockApi::new().with_leader("server-1", "10.0.0.11:4647"));
    let scenario = Scenario::new("clean")
        .step(record("inject", "a"))
        .step(Step::wait("settle", Duration::from_millis(20)))
        .step(Step::assert("leader", "leader-elected"))
        .step(Step::assert("healthy", "nomad-api-healthy"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(report.success, "{:?}", report.error);
    assert!(report.error.is_none());
    assert_eq!(report.stats().failed_steps, 0);
    assert_eq!(report.stats().success_steps, 4);
    assert_eq!(report.stats().cleanup_steps, 1);
    assert_eq!(h.journal.rollbacks(), vec!["rollback:a"]);
}

#[tokio::test]
async fn test_rollback_runs_once_per_action_in_reverse_order() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("order")
        .step(record("first", "a"))
        .step(record("second", "b"))
        .step(record("third", "c"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(report.success);
    assert_eq!(
        h.journal.entries(),
        vec![
            "execute:a",
            "execute:b",
            "execute:c",
            "rollback:c",
            "rollback:b",
            "rollback:a",
        ]
    );
    let rollback_steps: Vec<_> = report
        .events_of(EventType::Cleanup)
        .map(|e| e.step.as_str())
        .collect();
    assert_eq!(rollback_steps, vec!["rollback-record"; 3]);
}

#[tokio::test]
async fn test_failed_run_still_rolls_back_every_attempt() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("fails")
        .step(record("first", "a"))
        .step(failing("second", "b").with_retries(2))
        .step(record("never", "z"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(!report.success);
    assert_eq!(report.error, Some(ChaosError::remote("b failed")));
    // Both attempts of the failing step may have changed the cluster.
    assert_eq!(h.journal.rollbacks(), vec!["rollback:b", "rollback:b", "rollback:a"]);
    assert!(!h.journal.entries().contains(&"execute:z".to_string()));
    assert_eq!(report.events_of(EventType::Info).count(), 1);
    assert!(
        report
            .events_of(EventType::Failure)
            .any(|e| e.message == "remote failure: b failed (after 2 attempts)")
    );
}

#[tokio::test]
async fn test_continue_policy_advances_and_run_succeeds() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("continue")
        .step(failing("flaky", "a").with_retries(3).with_on_error(OnError::Continue))
        .step(record("after", "b"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(report.success);
    assert!(report.error.is_none());
    assert_eq!(report.stats().failed_steps, 1);
    assert!(h.journal.entries().contains(&"execute:b".to_string()));
    assert_eq!(report.events_of(EventType::Info).count(), 2);
}

#[tokio::test]
async fn test_cleanup_policy_stops_without_failing() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("cleanup")
        .step(record("first", "a"))
        .step(failing("broken", "b").with_on_error(OnError::Cleanup))
        .step(record("skipped", "c"))
        .cleanup_step(record("explicit", "cleanup"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(report.success);
    assert_eq!(
        h.journal.entries(),
        vec![
            "execute:a",
            "execute:b",
            "execute:cleanup",
            "rollback:b",
            "rollback:a",
        ]
    );
}

#[tokio::test]
async fn test_explicit_cleanup_runs_before_rollback() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("teardown-order")
        .step(record("inject", "a"))
        .step(failing("boom", "b"))
        .cleanup_step(record("first-cleanup", "c1"))
        .cleanup_step(failing("second-cleanup", "c2"))
        .cleanup_step(record("third-cleanup", "c3"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(!report.success);
    assert_eq!(
        h.journal.entries(),
        vec![
            "execute:a",
            "execute:b",
            "execute:c1",
            "execute:c2",
            "execute:c3",
            "rollback:b",
            "rollback:a",
        ]
    );
    // The cleanup failure is recorded but is not the run's error.
    assert_eq!(report.error, Some(ChaosError::remote("b failed")));
    let teardown: Vec<_> = report
        .events()
        .iter()
        .skip_while(|e| e.step != "first-cleanup")
        .map(|e| (e.event_type, e.step.as_str()))
        .collect();
    assert_eq!(
        teardown,
        vec![
            (EventType::Cleanup, "first-cleanup"),
            (EventType::Error, "second-cleanup"),
            (EventType::Cleanup, "third-cleanup"),
            (EventType::Cleanup, "rollback-record"),
            (EventType::Cleanup, "rollback-record"),
        ]
    );
}

#[tokio::test]
async fn test_rollback_failure_does_not_block_the_rest() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("partial")
        .step(record("first", "a"))
        .step(Step::action("second", "record").with_args(tag("b").with("fail_rollback", true)))
        .step(record("third", "c"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(report.success);
    assert_eq!(h.journal.rollbacks(), vec!["rollback:c", "rollback:b", "rollback:a"]);
    let errors: Vec<_> = report.events_of(EventType::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].step, "rollback-record");
    assert!(errors[0].message.starts_with("rollback failed: record:"));
    assert_eq!(report.stats().cleanup_steps, 2);
}

#[tokio::test]
async fn test_partition_target_failure_leaves_source_clean() {
    let h = Harness::new(3, MockApi::new());
    h.driver.respond_on(
        "server-1",
        "iptables -I",
        MockReply::exit_with_stderr(1, "iptables: No chain/target/match by that name."),
    );
    let scenario = Scenario::new("split").step(Step::action("split", "partition").with_args(
        Args::new().with("source", "server-0").with("target", "server-1"),
    ));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(!report.success);
    assert!(h.driver.rules_on("server-0").is_empty());
    assert!(h.driver.rules_on("server-1").is_empty());
    // The unwind met "Bad rule" for the never-installed target rules, which
    // leaves nothing for teardown to report.
    assert!(
        h.driver
            .commands_on("server-1")
            .iter()
            .any(|c| c.starts_with("iptables -D"))
    );
    let rollback_errors: Vec<_> = report
        .events_of(EventType::Error)
        .filter(|e| e.step == "rollback-partition")
        .collect();
    assert!(rollback_errors.is_empty(), "{rollback_errors:?}");
    assert!(
        report
            .events_of(EventType::Cleanup)
            .any(|e| e.step == "rollback-partition")
    );
}

#[tokio::test]
async fn test_partition_is_healed_by_teardown() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("split")
        .step(Step::action("split", "partition").with_args(
            Args::new().with("source", "server-0").with("target", "server-2"),
        ))
        .step(failing("boom", "x"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(!report.success);
    assert!(h.driver.rules_on("server-0").is_empty());
    assert!(h.driver.rules_on("server-2").is_empty());
    assert!(
        report
            .events_of(EventType::Cleanup)
            .any(|e| e.step == "rollback-partition")
    );
}

#[tokio::test]
async fn test_kill_leader_is_restarted_by_teardown() {
    let h = Harness::new(3, MockApi::new().with_leader("server-2", "10.0.0.0:4647"));
    let scenario = Scenario::new("kill")
        .step(Step::action("kill", "kill-leader").with_args(Args::new().with("signal", "KILL")))
        .step(Step::assert("re-elected", "leader-elected"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(report.success);
    assert_eq!(
        h.driver.commands_on("server-0"),
        vec!["pkill -KILL nomad", "systemctl restart nomad"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_returns_at_cancellation_not_duration() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("wait")
        .step(record("inject", "a"))
        .step(Step::wait("long", Duration::from_secs(60)).with_on_error(OnError::Continue))
        .step(record("never", "z"));

    let (ctx, handle) = RunContext::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let report = h.runner.run(&ctx, &scenario).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(31), "took {elapsed:?}");
    // Cancellation overrides the continue policy.
    assert!(!report.success);
    assert_eq!(report.error, Some(ChaosError::Cancelled));
    assert!(!h.journal.entries().contains(&"execute:z".to_string()));
    // Teardown is detached from the cancelled context.
    assert_eq!(h.journal.rollbacks(), vec!["rollback:a"]);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_timeout_fails_run() {
    let h = Harness::new(3, MockApi::new());
    let scenario = Scenario::new("slow")
        .with_timeout(Duration::from_secs(5))
        .step(record("inject", "a"))
        .step(Step::wait("too-long", Duration::from_secs(10)).with_on_error(OnError::Continue))
        .step(record("never", "z"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(!report.success);
    assert!(matches!(report.error, Some(ChaosError::Timeout(_))));
    assert_eq!(h.journal.rollbacks(), vec!["rollback:a"]);
    assert_eq!(report.events_of(EventType::Error).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_remote_command_is_bounded_by_step_timeout() {
    let h = Harness::new(3, MockApi::new());
    h.driver.respond_on_times("server-0", "pkill", MockReply::Hang, 1);
    let scenario = Scenario::new("hang")
        .step(Step::action("kill", "kill-leader").with_timeout(Duration::from_secs(2)));

    let started = Instant::now();
    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!report.success);
    assert!(matches!(report.error, Some(ChaosError::Timeout(_))));
    // The hung attempt still recorded its target, so teardown restarts it.
    assert!(
        h.driver
            .commands_on("server-0")
            .contains(&"systemctl restart nomad".to_string())
    );
}

#[tokio::test]
async fn test_assertion_quorum_through_runner() {
    let api = (0..5).fold(MockApi::new(), |api, i| {
        api.with_health(&format!("server-{i}"), i < 2)
    });
    let h = Harness::new(5, api);
    let scenario = Scenario::new("quorum").step(Step::assert("healthy", "nomad-api-healthy"));

    let report = h.runner.run(&RunContext::background(), &scenario).await;

    assert!(!report.success);
    let failure = report.events_of(EventType::Failure).next().unwrap();
    let details = failure.details.as_ref().unwrap();
    assert_eq!(details["healthy_count"], 2);
    assert!(matches!(
        report.error,
        Some(ChaosError::AssertionFailed { ref assertion, .. }) if assertion == "nomad-api-healthy"
    ));
}

#[test]
fn test_duplicate_registration_keeps_first() {
    let registry = ActionRegistry::with_builtins().unwrap();
    let err = registry
        .register(Arc::new(chaos_core::PartitionAction))
        .unwrap_err();
    assert!(matches!(err, ChaosError::AlreadyRegistered { ref name, .. } if name == "partition"));
    assert_eq!(
        registry.get("partition").unwrap().description(),
        "Create a network partition between two nodes using iptables DROP rules"
    );
}
