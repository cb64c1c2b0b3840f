//! Scenario execution state machine.
//!
//! Steps run strictly in order under the scenario's context. Every action
//! attempt is remembered, and teardown (explicit cleanup steps, then
//! rollback of every remembered attempt, newest first) runs at the end of
//! every run whatever the outcome. Teardown uses contexts detached from the
//! run so that a cancelled or expired run still reverses its faults.

use crate::action::{Action, ActionRegistry, RunState};
use crate::assertion::AssertionRegistry;
use crate::context::RunContext;
use crate::driver::ClusterView;
use crate::error::{ChaosError, Result};
use crate::report::{Event, EventType, Report};
use crate::scenario::{OnError, Scenario, Step, StepKind};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Pause between failed attempts of the same step.
    pub retry_interval: Duration,
    /// Budget for each cleanup step and each rollback during teardown.
    pub teardown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    StepSucceeded,
    StepFailed,
    CleaningUp,
    Finished,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::StepSucceeded => write!(f, "step_succeeded"),
            Self::StepFailed => write!(f, "step_failed"),
            Self::CleaningUp => write!(f, "cleaning_up"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// One action attempt awaiting rollback.
struct Executed {
    name: String,
    action: Arc<dyn Action>,
    state: RunState,
}

/// Result of a single attempt.
struct Attempt {
    result: Result<String>,
    details: BTreeMap<String, Value>,
}

impl Attempt {
    fn failed(err: ChaosError) -> Self {
        Self {
            result: Err(err),
            details: BTreeMap::new(),
        }
    }
}

/// Final result of a step after all its attempts.
struct StepOutcome {
    result: Result<String>,
    details: BTreeMap<String, Value>,
    attempts: u32,
    duration: Duration,
    /// The step's context finished (cancellation or a deadline) before it did.
    interrupted: bool,
}

pub struct Runner {
    view: ClusterView,
    actions: Arc<ActionRegistry>,
    assertions: Arc<AssertionRegistry>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        view: ClusterView,
        actions: Arc<ActionRegistry>,
        assertions: Arc<AssertionRegistry>,
    ) -> Self {
        Self {
            view,
            actions,
            assertions,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `scenario` to completion, including teardown.
    ///
    /// The returned report is always finished. `report.error` is set when the
    /// run failed: a `fail`-policy step exhausted its attempts, the run was
    /// cancelled or timed out, or the scenario did not validate.
    pub async fn run(&self, ctx: &RunContext, scenario: &Scenario) -> Report {
        let mut report = Report::new(&scenario.name, &scenario.description);

        if let Err(err) = scenario.validate() {
            warn!(scenario = %scenario.name, "scenario rejected: {}", err);
            report.add_event(Event::new(EventType::Error, "validate", err.to_string()));
            report.finish(false, Some(err));
            return report;
        }

        let run_ctx = ctx.with_optional_timeout(scenario.timeout);
        report.add_event(Event::new(
            EventType::Start,
            "",
            format!("starting scenario {}", scenario.name),
        ));
        self.enter(RunPhase::Running, scenario, None);

        let mut executed = Vec::new();
        let mut failure = None;

        for step in &scenario.steps {
            let label = step.label();

            if let Some(err) = run_ctx.err() {
                report.add_event(Event::new(
                    EventType::Error,
                    &label,
                    format!("scenario interrupted before step: {err}"),
                ));
                failure = Some(err);
                break;
            }

            info!(scenario = %scenario.name, step = %label, "executing step");
            let outcome = self
                .execute_step(&run_ctx, step, &label, Some(&mut executed), &mut report)
                .await;

            let err = match outcome.result {
                Ok(message) => {
                    self.enter(RunPhase::StepSucceeded, scenario, Some(&label));
                    report.add_event(
                        Event::new(EventType::Success, &label, message)
                            .with_duration(outcome.duration)
                            .with_details(outcome.details),
                    );
                    continue;
                }
                Err(err) => err,
            };

            self.enter(RunPhase::StepFailed, scenario, Some(&label));
            let event_type = if outcome.interrupted {
                EventType::Error
            } else {
                EventType::Failure
            };
            report.add_event(
                Event::new(event_type, &label, failure_message(&err, outcome.attempts))
                    .with_duration(outcome.duration)
                    .with_details(outcome.details),
            );

            // The run itself ending overrides the step's policy.
            if run_ctx.err().is_some() {
                warn!(scenario = %scenario.name, step = %label, "run interrupted: {}", err);
                failure = Some(err);
                break;
            }

            match step.on_error {
                OnError::Continue => {
                    warn!(step = %label, "step failed, continuing: {}", err);
                }
                OnError::Cleanup => {
                    warn!(step = %label, "step failed, skipping to cleanup: {}", err);
                    break;
                }
                OnError::Fail => {
                    warn!(step = %label, "step failed, aborting: {}", err);
                    failure = Some(err);
                    break;
                }
            }
        }

        self.enter(RunPhase::CleaningUp, scenario, None);
        self.teardown(scenario, executed, &mut report).await;

        let success = failure.is_none();
        report.finish(success, failure);
        self.enter(RunPhase::Finished, scenario, None);
        info!(
            scenario = %scenario.name,
            success,
            total = report.stats().total_steps,
            failed = report.stats().failed_steps,
            "scenario finished"
        );
        report
    }

    /// Run one step with its timeout and retry budget.
    ///
    /// Action attempts are pushed onto `executed` when it is given.
    async fn execute_step(
        &self,
        ctx: &RunContext,
        step: &Step,
        label: &str,
        mut executed: Option<&mut Vec<Executed>>,
        report: &mut Report,
    ) -> StepOutcome {
        let step_ctx = ctx.with_optional_timeout(step.timeout);
        let max_attempts = step.retries.max(1);
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            debug!(step = label, attempt, max_attempts, "starting attempt");
            let Attempt { result, details } =
                self.attempt(&step_ctx, step, executed.as_deref_mut()).await;

            let err = match result {
                Ok(message) => {
                    return StepOutcome {
                        result: Ok(message),
                        details,
                        attempts: attempt,
                        duration: started.elapsed(),
                        interrupted: false,
                    };
                }
                Err(err) => err,
            };

            let interrupted = step_ctx.err().is_some();
            if interrupted || !err.is_retryable() || attempt >= max_attempts {
                return StepOutcome {
                    result: Err(err),
                    details,
                    attempts: attempt,
                    duration: started.elapsed(),
                    interrupted,
                };
            }

            warn!(step = label, attempt, "attempt failed (retryable): {}", err);
            report.add_event(Event::new(
                EventType::Info,
                label,
                format!("attempt {attempt}/{max_attempts} failed, retrying: {err}"),
            ));

            if let Err(interrupt) = step_ctx.sleep(self.config.retry_interval).await {
                return StepOutcome {
                    result: Err(interrupt),
                    details,
                    attempts: attempt,
                    duration: started.elapsed(),
                    interrupted: true,
                };
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        ctx: &RunContext,
        step: &Step,
        executed: Option<&mut Vec<Executed>>,
    ) -> Attempt {
        let kind = match step.kind() {
            Ok(kind) => kind,
            Err(err) => return Attempt::failed(err),
        };

        match kind {
            StepKind::Action(name) => {
                let action = match self.actions.get(name) {
                    Ok(action) => action,
                    Err(err) => return Attempt::failed(err),
                };
                let mut state = RunState::new();
                let result = ctx
                    .run(action.execute(ctx, &self.view, &mut state, &step.args))
                    .await
                    .and_then(|r| r);
                // Kept even on failure: the attempt may have changed the cluster.
                if let Some(executed) = executed {
                    executed.push(Executed {
                        name: name.to_string(),
                        action,
                        state,
                    });
                }
                Attempt {
                    result: result.map(|()| format!("executed {name}")),
                    details: BTreeMap::new(),
                }
            }
            StepKind::Assert(name) => {
                let assertion = match self.assertions.get(name) {
                    Ok(assertion) => assertion,
                    Err(err) => return Attempt::failed(err),
                };
                match ctx
                    .run(assertion.check(ctx, &self.view, &step.args))
                    .await
                    .and_then(|r| r)
                {
                    Ok(check) if check.success => Attempt {
                        result: Ok(check.message),
                        details: check.details,
                    },
                    Ok(check) => Attempt {
                        result: Err(ChaosError::AssertionFailed {
                            assertion: check.assertion,
                            message: check.message,
                        }),
                        details: check.details,
                    },
                    Err(err) => Attempt::failed(err),
                }
            }
            StepKind::Wait(duration) => {
                debug!(duration = %humantime::format_duration(duration), "waiting");
                Attempt {
                    result: ctx
                        .sleep(duration)
                        .await
                        .map(|()| format!("waited {}", humantime::format_duration(duration))),
                    details: BTreeMap::new(),
                }
            }
        }
    }

    /// Cleanup steps in declared order, then rollback newest first.
    async fn teardown(&self, scenario: &Scenario, executed: Vec<Executed>, report: &mut Report) {
        for step in &scenario.cleanup {
            let label = step.label();
            info!(scenario = %scenario.name, step = %label, "running cleanup step");
            let ctx = RunContext::detached(self.config.teardown_timeout);
            let outcome = self.execute_step(&ctx, step, &label, None, report).await;
            let event = match outcome.result {
                Ok(message) => Event::new(EventType::Cleanup, &label, message),
                Err(err) => {
                    warn!(step = %label, "cleanup step failed: {}", err);
                    Event::new(
                        EventType::Error,
                        &label,
                        failure_message(&err, outcome.attempts),
                    )
                }
            };
            report.add_event(
                event
                    .with_duration(outcome.duration)
                    .with_details(outcome.details),
            );
        }

        for done in executed.into_iter().rev() {
            let label = format!("rollback-{}", done.name);
            info!(scenario = %scenario.name, action = %done.name, "rolling back");
            let ctx = RunContext::detached(self.config.teardown_timeout);
            let started = Instant::now();
            let result = ctx
                .run(done.action.rollback(&ctx, &self.view, &done.state))
                .await
                .and_then(|r| r);

            let event = match result {
                Ok(()) => Event::new(EventType::Cleanup, &label, format!("rolled back {}", done.name)),
                Err(err) => {
                    let err = ChaosError::PartialRollback(format!("{}: {err}", done.name));
                    warn!(action = %done.name, "{}", err);
                    Event::new(EventType::Error, &label, err.to_string())
                }
            };
            report.add_event(event.with_duration(started.elapsed()));
        }
    }

    fn enter(&self, phase: RunPhase, scenario: &Scenario, step: Option<&str>) {
        debug!(scenario = %scenario.name, phase = %phase, step = step.unwrap_or(""), "phase");
    }
}

fn failure_message(err: &ChaosError, attempts: u32) -> String {
    if attempts > 1 {
        format!("{err} (after {attempts} attempts)")
    } else {
        err.to_string()
    }
}
