//! Subcommand implementations.

use crate::api::NomadApi;
use crate::config::Config;
use crate::driver::NomadDriver;
use crate::output::{self, ReportFormat};
use crate::{scenario_file, state_file};
use anyhow::{Context, Result, bail};
use chaos_core::{
    Action, ActionRegistry, Args, Assertion, AssertionRegistry, Capability, CheckResult,
    ClusterView, Driver, RunContext, RunState, Runner,
};
use state_file::HealState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct App {
    config: Arc<Config>,
    verbose: bool,
    actions: Arc<ActionRegistry>,
    assertions: Arc<AssertionRegistry>,
}

impl App {
    pub fn new(config: Config, verbose: bool) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            verbose,
            actions: Arc::new(ActionRegistry::with_builtins()?),
            assertions: Arc::new(AssertionRegistry::with_builtins()?),
        })
    }

    /// Build the production driver and discover the cluster.
    async fn connect(&self, ctx: &RunContext) -> Result<ClusterView> {
        let api = Arc::new(NomadApi::new(self.config.api.clone()).context("building API client")?);
        let driver = Arc::new(NomadDriver::new(self.config.clone(), api.clone()));
        let cluster = driver.discover(ctx).await.context("discovering cluster")?;
        if self.verbose {
            println!("Discovered {} servers", cluster.servers.len());
            for server in &cluster.servers {
                println!("  {}: {} ({})", server.name, server.public_ip, server.private_ip);
            }
            println!();
        }
        Ok(ClusterView::new(Arc::new(cluster), driver, api))
    }

    async fn disconnect(view: &ClusterView) {
        if let Err(e) = view.driver.close().await {
            debug!("closing driver: {}", e);
        }
    }

    pub async fn run(
        &self,
        name: &str,
        timeout: Duration,
        extra_dir: Option<PathBuf>,
        format: ReportFormat,
        output_file: Option<&Path>,
    ) -> Result<bool> {
        let mut search_paths: Vec<PathBuf> = extra_dir.into_iter().collect();
        search_paths.push(PathBuf::from("."));
        search_paths.extend(self.config.scenarios.search_paths.iter().cloned());

        let path = scenario_file::find(name, &search_paths)?;
        let scenario = scenario_file::load(&path)?;

        let chatty = format != ReportFormat::Json || output_file.is_some();
        if chatty {
            println!("Running scenario: {}", scenario.name);
            if !scenario.description.is_empty() {
                println!("Description: {}", scenario.description);
            }
            println!("Steps: {}", scenario.steps.len());
            println!();
        }

        let ctx = root_context(timeout);
        let view = self.connect(&ctx).await?;
        let runner = Runner::new(view.clone(), self.actions.clone(), self.assertions.clone())
            .with_config(self.config.runner.to_runner_config());
        let report = runner.run(&ctx, &scenario).await;
        Self::disconnect(&view).await;

        let rendered = output::render(&report, format)?;
        match output_file {
            Some(path) => {
                output::write_to(path, &rendered)?;
                println!("{}", output::render(&report, ReportFormat::Compact)?);
                println!("Report written to {}", path.display());
            }
            None => println!("{rendered}"),
        }
        Ok(report.success)
    }

    pub async fn inject(&self, name: &str, pairs: &[String], timeout: Duration) -> Result<bool> {
        let state_path = &self.config.state.path;
        if let Some(pending) = state_file::load(state_path)? {
            bail!(
                "a {} fault injected at {} is still recorded in {}; run `chaos heal` first",
                pending.action,
                pending.injected_at,
                state_path.display()
            );
        }
        let action = self.action(name)?;
        let args = Args::from_pairs(pairs).context("parsing arguments")?;

        let ctx = root_context(timeout);
        let view = self.connect(&ctx).await?;
        println!("Executing action: {}", action.name());
        let started = Instant::now();
        let result = inject_fault(&ctx, &view, action.as_ref(), &args, state_path).await;
        Self::disconnect(&view).await;

        result?;
        println!("Action completed in {}", humantime::format_duration(round_ms(started.elapsed())));
        println!("Run `chaos heal` to roll it back.");
        Ok(true)
    }

    pub async fn heal(&self, timeout: Duration) -> Result<bool> {
        let state_path = &self.config.state.path;
        let Some(pending) = state_file::load(state_path)? else {
            bail!("no injected fault to heal ({} not found)", state_path.display());
        };
        let action = self.action(&pending.action)?;

        let ctx = root_context(timeout);
        let view = self.connect(&ctx).await?;
        println!("Rolling back action: {}", action.name());
        let started = Instant::now();
        let result = heal_fault(&ctx, &view, action.as_ref(), &pending, state_path).await;
        Self::disconnect(&view).await;

        result?;
        println!("Rollback completed in {}", humantime::format_duration(round_ms(started.elapsed())));
        Ok(true)
    }

    pub async fn assert(
        &self,
        name: &str,
        pairs: &[String],
        within: Option<Duration>,
        timeout: Duration,
    ) -> Result<bool> {
        let assertion = match self.assertions.get(name) {
            Ok(a) => a,
            Err(e) => {
                println!("Available assertions: {}", self.assertions.list().join(", "));
                return Err(e.into());
            }
        };
        let args = Args::from_pairs(pairs).context("parsing arguments")?;

        let ctx = root_context(timeout);
        let view = self.connect(&ctx).await?;
        println!("Running assertion: {}", assertion.name());
        let interval = self.config.runner.to_runner_config().retry_interval;
        let result = poll_assertion(&ctx, &view, assertion.as_ref(), &args, within, interval).await;
        Self::disconnect(&view).await;

        let result = result.context("assertion error")?;
        if result.success {
            println!("PASS: {}", result.message);
        } else {
            println!("FAIL: {}", result.message);
        }
        if self.verbose {
            println!("  duration: {}", humantime::format_duration(round_ms(result.duration)));
            println!("  attempts: {}", result.attempts);
            for (key, value) in &result.details {
                println!("  {key}: {value}");
            }
        }
        Ok(result.success)
    }

    fn action(&self, name: &str) -> Result<Arc<dyn Action>> {
        self.actions.get(name).map_err(|e| {
            println!("Available actions: {}", self.actions.list().join(", "));
            e.into()
        })
    }
}

pub fn list() -> Result<bool> {
    let actions = ActionRegistry::with_builtins()?;
    let assertions = AssertionRegistry::with_builtins()?;
    println!("Actions:");
    for action in sorted(actions.all()) {
        println!("  {:<20} {}", action.name(), action.description());
    }
    println!();
    println!("Assertions:");
    for assertion in sorted(assertions.all()) {
        println!("  {:<20} {}", assertion.name(), assertion.description());
    }
    Ok(true)
}

/// Re-render a saved JSON report.
pub fn report(path: &Path, format: ReportFormat, output_file: Option<&Path>) -> Result<bool> {
    let report = output::load(path)?;
    let rendered = output::render(&report, format)?;
    match output_file {
        Some(out) => {
            output::write_to(out, &rendered)?;
            println!("Report written to {}", out.display());
        }
        None => println!("{rendered}"),
    }
    Ok(true)
}

fn sorted<C: Capability + ?Sized>(mut items: Vec<Arc<C>>) -> Vec<Arc<C>> {
    items.sort_by(|a, b| a.name().cmp(b.name()));
    items
}

/// Root context bounded by `timeout` and cancelled on Ctrl-C.
fn root_context(timeout: Duration) -> RunContext {
    let (ctx, cancel) = RunContext::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
    ctx.with_timeout(timeout)
}

fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Execute `action` once and persist its state whenever it left something
/// to roll back, even on failure, so a partial injection can still be healed.
pub async fn inject_fault(
    ctx: &RunContext,
    view: &ClusterView,
    action: &dyn Action,
    args: &Args,
    state_path: &Path,
) -> Result<RunState> {
    let mut state = RunState::new();
    let result = action.execute(ctx, view, &mut state, args).await;
    if action.needs_rollback(&state) {
        let handle = HealState::new(action.name(), state.clone(), view.cluster.name.clone());
        state_file::save(state_path, &handle)?;
        info!(action = action.name(), path = %state_path.display(), "recorded heal state");
    }
    result.with_context(|| format!("action {} failed", action.name()))?;
    Ok(state)
}

/// Roll back a recorded injection; the record is removed only on success.
pub async fn heal_fault(
    ctx: &RunContext,
    view: &ClusterView,
    action: &dyn Action,
    pending: &HealState,
    state_path: &Path,
) -> Result<()> {
    if pending.cluster != view.cluster.name {
        warn!(
            recorded = %pending.cluster,
            current = %view.cluster.name,
            "heal state was recorded against a different cluster"
        );
    }
    action
        .rollback(ctx, view, &pending.state)
        .await
        .with_context(|| format!("rollback of {} failed", pending.action))?;
    state_file::remove(state_path)
}

/// Check once, or keep checking every `interval` until the assertion passes
/// or `within` elapses.
pub async fn poll_assertion(
    ctx: &RunContext,
    view: &ClusterView,
    assertion: &dyn Assertion,
    args: &Args,
    within: Option<Duration>,
    interval: Duration,
) -> chaos_core::Result<CheckResult> {
    let window = within.map(|w| ctx.with_timeout(w));
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let outcome = assertion.check(ctx, view, args).await;
        let more = window.as_ref().is_some_and(|w| w.err().is_none());
        match outcome {
            Ok(mut result) if result.success || !more => {
                if attempts > 1 {
                    result.attempts = attempts;
                    result.duration = started.elapsed();
                }
                return Ok(result);
            }
            Err(e) if !more || !e.is_retryable() => return Err(e),
            Ok(result) => debug!(attempt = attempts, "not yet satisfied: {}", result.message),
            Err(e) => debug!(attempt = attempts, "check failed: {}", e),
        }
        if let Some(window) = &window {
            if window.sleep(interval).await.is_err() {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
            }
        }
    }
}
