//! Fault-injection scenario engine for Nomad clusters.
//!
//! A [`Scenario`] is an ordered list of steps, each an [`Action`] that
//! injects a reversible fault, an [`Assertion`] that checks cluster state, or
//! a wait. The [`Runner`] executes the steps with per-step timeouts, retries
//! and error policies, and always finishes with teardown: explicit cleanup
//! steps followed by rollback of every action attempt in reverse order.
//!
//! The engine reaches the cluster only through the [`Driver`], [`Session`]
//! and [`ClusterApi`] traits; concrete transports live in the `chaos` binary.

#![forbid(unsafe_code)]

pub mod action;
pub mod args;
pub mod assertion;
pub mod cluster;
pub mod context;
pub mod driver;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scenario;

pub use action::{Action, ActionRegistry, KillLeaderAction, PartitionAction, RunState};
pub use args::{ArgValue, Args};
pub use assertion::{
    ApiHealthyAssertion, Assertion, AssertionRegistry, CheckResult, LeaderElectedAssertion,
};
pub use cluster::{Cluster, Node, NodeRole};
pub use context::{CancelHandle, RunContext};
pub use driver::{ClusterApi, ClusterView, CommandOutput, Driver, Session};
pub use error::{ChaosError, Result};
pub use logging::{LogConfig, LogFormat, init_logging, init_test_logging};
pub use registry::{Capability, Registry};
pub use report::{Event, EventType, Report, Stats};
pub use runner::{RunPhase, Runner, RunnerConfig};
pub use scenario::{OnError, Scenario, Step, StepKind};
