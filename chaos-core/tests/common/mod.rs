use async_trait::async_trait;
use chaos_core::mock::{MockApi, MockDriver, server_cluster};
use chaos_core::{
    Action, ActionRegistry, Args, AssertionRegistry, Capability, ChaosError, ClusterView,
    Result, RunContext, RunState, Runner, RunnerConfig,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use chaos_core::init_test_logging;

/// Shared log of `execute:<tag>` / `rollback:<tag>` entries.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with("rollback:"))
            .collect()
    }
}

/// Action that records its calls; `fail=true` makes execute fail after
/// recording state, `fail_rollback=true` makes rollback fail.
pub struct RecordingAction {
    pub journal: Journal,
}

impl Capability for RecordingAction {
    fn name(&self) -> &str {
        "record"
    }

    fn description(&self) -> &str {
        "Record execute and rollback calls"
    }
}

#[async_trait]
impl Action for RecordingAction {
    async fn execute(
        &self,
        _ctx: &RunContext,
        _view: &ClusterView,
        state: &mut RunState,
        args: &Args,
    ) -> Result<()> {
        let tag = args.str_or("tag", "untagged")?.to_string();
        self.journal.push(format!("execute:{tag}"));
        state.set("tag", tag.clone());
        state.set("fail_rollback", args.bool_or("fail_rollback", false)?);
        if args.bool_or("fail", false)? {
            return Err(ChaosError::remote(format!("{tag} failed")));
        }
        Ok(())
    }

    async fn rollback(&self, _ctx: &RunContext, _view: &ClusterView, state: &RunState) -> Result<()> {
        let tag = state.require_str("tag")?;
        self.journal.push(format!("rollback:{tag}"));
        if state.get_bool("fail_rollback") == Some(true) {
            return Err(ChaosError::remote(format!("cannot undo {tag}")));
        }
        Ok(())
    }
}

pub struct Harness {
    pub driver: MockDriver,
    pub journal: Journal,
    pub runner: Runner,
}

impl Harness {
    pub fn new(servers: usize, api: MockApi) -> Self {
        init_test_logging();
        let driver = MockDriver::new(server_cluster(servers));
        driver.set_leader("server-0");
        let journal = Journal::default();

        let actions = ActionRegistry::with_builtins().unwrap();
        actions
            .register(Arc::new(RecordingAction {
                journal: journal.clone(),
            }))
            .unwrap();

        let runner = Runner::new(
            driver.view(api),
            Arc::new(actions),
            Arc::new(AssertionRegistry::with_builtins().unwrap()),
        )
        .with_config(RunnerConfig {
            retry_interval: Duration::from_millis(10),
            teardown_timeout: Duration::from_secs(5),
        });

        Self {
            driver,
            journal,
            runner,
        }
    }
}

pub fn tag(tag: &str) -> Args {
    Args::new().with("tag", tag)
}
