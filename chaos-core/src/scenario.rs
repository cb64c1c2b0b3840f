//! Declarative scenario model and its validation.

use crate::args::Args;
use crate::error::{ChaosError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What the runner does once a step has exhausted its attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Stop, mark the run failed and tear down.
    #[default]
    Fail,
    /// Record the failure and move on to the next step.
    Continue,
    /// Stop advancing and tear down without failing the run.
    Cleanup,
}

impl std::fmt::Display for OnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Continue => write!(f, "continue"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// The single thing a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind<'a> {
    Action(&'a str),
    Assert(&'a str),
    Wait(Duration),
}

fn default_retries() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<String>,
    #[serde(default, with = "opt_duration", skip_serializing_if = "Option::is_none")]
    pub wait: Option<Duration>,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default, with = "opt_duration", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Step {
    fn blank(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: None,
            assert: None,
            wait: None,
            args: Args::new(),
            on_error: OnError::Fail,
            retries: default_retries(),
            timeout: None,
        }
    }

    pub fn action(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::blank(name)
        }
    }

    pub fn assert(name: impl Into<String>, assertion: impl Into<String>) -> Self {
        Self {
            assert: Some(assertion.into()),
            ..Self::blank(name)
        }
    }

    pub fn wait(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            wait: Some(duration),
            ..Self::blank(name)
        }
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The step's discriminator; fails unless exactly one is set.
    pub fn kind(&self) -> Result<StepKind<'_>> {
        match (self.action.as_deref(), self.assert.as_deref(), self.wait) {
            (Some(action), None, None) if !action.is_empty() => Ok(StepKind::Action(action)),
            (None, Some(assert), None) if !assert.is_empty() => Ok(StepKind::Assert(assert)),
            (None, None, Some(wait)) if !wait.is_zero() => Ok(StepKind::Wait(wait)),
            (None, None, None) => Err(ChaosError::InvalidScenario(
                "step must have one of action, assert or wait".to_string(),
            )),
            (Some(""), None, None) | (None, Some(""), None) => Err(ChaosError::InvalidScenario(
                "step capability name is empty".to_string(),
            )),
            (None, None, Some(_)) => {
                Err(ChaosError::InvalidScenario("wait must be greater than zero".to_string()))
            }
            _ => Err(ChaosError::InvalidScenario(
                "step must have only one of action, assert or wait".to_string(),
            )),
        }
    }

    /// Name used in reports; falls back to what the step does.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.kind() {
            Ok(StepKind::Action(name) | StepKind::Assert(name)) => name.to_string(),
            Ok(StepKind::Wait(d)) => format!("wait {}", humantime::format_duration(d)),
            Err(_) => "unnamed".to_string(),
        }
    }

    pub fn validate(&self, scenario_timeout: Option<Duration>) -> Result<()> {
        self.kind()?;
        if self.retries < 1 {
            return Err(ChaosError::InvalidScenario("retries must be at least 1".to_string()));
        }
        if let (Some(step), Some(scenario)) = (self.timeout, scenario_timeout) {
            if step > scenario {
                return Err(ChaosError::InvalidScenario(format!(
                    "timeout {} exceeds scenario timeout {}",
                    humantime::format_duration(step),
                    humantime::format_duration(scenario)
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "opt_duration", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub cleanup: Vec<Step>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            timeout: None,
            steps: Vec::new(),
            cleanup: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn cleanup_step(mut self, step: Step) -> Self {
        self.cleanup.push(step);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ChaosError::InvalidScenario("scenario name is required".to_string()));
        }
        if self.steps.is_empty() {
            return Err(ChaosError::InvalidScenario(
                "scenario must have at least one step".to_string(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ChaosError::InvalidScenario("timeout must be greater than zero".to_string()));
        }
        for (i, step) in self.steps.iter().enumerate() {
            step.validate(self.timeout)
                .map_err(|e| e.context(format!("step {} ({})", i + 1, step.label())))?;
        }
        for (i, step) in self.cleanup.iter().enumerate() {
            step.validate(self.timeout)
                .map_err(|e| e.context(format!("cleanup step {} ({})", i + 1, step.label())))?;
        }
        Ok(())
    }
}

/// `Option<Duration>` as a humantime string (`"15s"`, `"1m30s"`), or an
/// integer number of seconds.
mod opt_duration {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.collect_str(&humantime::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Secs(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(Raw::Text(text)) => humantime::parse_duration(text.trim())
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid duration {text:?}: {e}"))),
        }
    }
}
