//! Fault-injection actions.
//!
//! An action mutates the live cluster in [`Action::execute`] and records in
//! its [`RunState`] every fact [`Action::rollback`] needs to reverse the
//! change. Rollback never sees the original arguments.

mod kill_leader;
mod partition;

pub use kill_leader::KillLeaderAction;
pub use partition::PartitionAction;

use crate::args::Args;
use crate::context::RunContext;
use crate::driver::ClusterView;
use crate::error::{ChaosError, Result};
use crate::registry::{Capability, Registry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait Action: Capability {
    /// Inject the fault. Must populate `state` before doing anything that
    /// needs reversing.
    async fn execute(
        &self,
        ctx: &RunContext,
        view: &ClusterView,
        state: &mut RunState,
        args: &Args,
    ) -> Result<()>;

    /// Best-effort reversal of whatever `state` says was done.
    async fn rollback(&self, ctx: &RunContext, view: &ClusterView, state: &RunState) -> Result<()>;

    /// Whether `state` records a change that [`Action::rollback`] would
    /// reverse. Used to decide if an injection must be remembered for a
    /// later heal.
    fn needs_rollback(&self, state: &RunState) -> bool {
        !state.is_empty()
    }
}

pub type ActionRegistry = Registry<dyn Action>;

impl ActionRegistry {
    /// Registry pre-populated with the built-in actions.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new("action");
        register_builtin_actions(&registry)?;
        Ok(registry)
    }
}

pub fn register_builtin_actions(registry: &ActionRegistry) -> Result<()> {
    registry.register(Arc::new(KillLeaderAction))?;
    registry.register(Arc::new(PartitionAction))?;
    Ok(())
}

/// Per-invocation state bridging one `execute` to its matching `rollback`.
///
/// Serializable so an out-of-band heal can be performed later from a
/// persisted copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState(BTreeMap<String, Value>);

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .ok_or_else(|| ChaosError::not_found(format!("{key} not recorded in run state")))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
