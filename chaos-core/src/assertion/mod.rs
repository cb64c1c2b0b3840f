//! Validation checks.
//!
//! Assertions never mutate the cluster and are safe to call repeatedly; the
//! runner retries them like any other step.

mod api_healthy;
mod leader_elected;

pub use api_healthy::ApiHealthyAssertion;
pub use leader_elected::LeaderElectedAssertion;

use crate::args::Args;
use crate::context::RunContext;
use crate::driver::ClusterView;
use crate::error::Result;
use crate::registry::{Capability, Registry};
use crate::report::duration_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Assertion: Capability {
    /// Run the check. An `Err` means the check could not be carried out;
    /// a completed check that found the cluster unhealthy returns
    /// `Ok` with `success == false`.
    async fn check(&self, ctx: &RunContext, view: &ClusterView, args: &Args) -> Result<CheckResult>;
}

pub type AssertionRegistry = Registry<dyn Assertion>;

impl AssertionRegistry {
    /// Registry pre-populated with the built-in assertions.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new("assertion");
        register_builtin_assertions(&registry)?;
        Ok(registry)
    }
}

pub fn register_builtin_assertions(registry: &AssertionRegistry) -> Result<()> {
    registry.register(Arc::new(LeaderElectedAssertion))?;
    registry.register(Arc::new(ApiHealthyAssertion))?;
    Ok(())
}

/// Outcome of one assertion check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub assertion: String,
    pub success: bool,
    pub message: String,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub attempts: u32,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl CheckResult {
    pub fn new(assertion: impl Into<String>) -> Self {
        Self {
            assertion: assertion.into(),
            success: false,
            message: String::new(),
            duration: Duration::ZERO,
            attempts: 0,
            details: BTreeMap::new(),
        }
    }

    pub fn detail(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.details.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered_in_sorted_order() {
        let registry = AssertionRegistry::with_builtins().unwrap();
        assert_eq!(registry.list(), vec!["leader-elected", "nomad-api-healthy"]);
        assert_eq!(registry.kind(), "assertion");
    }

    #[test]
    fn test_check_result_serializes_duration_as_millis() {
        let mut result = CheckResult::new("leader-elected");
        result.success = true;
        result.duration = Duration::from_millis(1500);
        result.attempts = 2;
        result.detail("leader", "10.0.0.5:4647");

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["details"]["leader"], "10.0.0.5:4647");
    }
}
