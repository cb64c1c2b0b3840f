//! Error taxonomy for scenario execution.
//!
//! Capability errors are local to a single attempt; the runner decides from
//! [`ChaosError::is_retryable`] whether another attempt is worth making.

/// Errors produced by capabilities, collaborators and the runner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChaosError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{kind} {name:?} already registered")]
    AlreadyRegistered { kind: &'static str, name: String },

    #[error("remote failure: {0}")]
    RemoteFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("rollback failed: {0}")]
    PartialRollback(String),

    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    /// A check ran to completion and found the cluster not in the expected state.
    #[error("assertion {assertion} failed: {message}")]
    AssertionFailed { assertion: String, message: String },
}

impl ChaosError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteFailure(msg.into())
    }

    /// Whether another attempt of the same step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RemoteFailure(_) | Self::Timeout(_) | Self::AssertionFailed { .. }
        )
    }

    /// Whether the error came from the run context rather than the cluster.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }

    /// Prefix the message with where the error happened, keeping the variant.
    pub fn context(self, what: impl std::fmt::Display) -> Self {
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(format!("{what}: {m}")),
            Self::NotFound(m) => Self::NotFound(format!("{what}: {m}")),
            Self::RemoteFailure(m) => Self::RemoteFailure(format!("{what}: {m}")),
            Self::Timeout(m) => Self::Timeout(format!("{what}: {m}")),
            Self::PartialRollback(m) => Self::PartialRollback(format!("{what}: {m}")),
            Self::InvalidScenario(m) => Self::InvalidScenario(format!("{what}: {m}")),
            other @ (Self::AlreadyRegistered { .. }
            | Self::Cancelled
            | Self::AssertionFailed { .. }) => other,
        }
    }

    /// Rebuild an error from its rendered message, as stored in a saved
    /// report. Messages that match no variant become [`ChaosError::RemoteFailure`].
    pub fn from_message(msg: &str) -> Self {
        if msg == "cancelled" {
            return Self::Cancelled;
        }
        let prefixed: [(&str, fn(String) -> Self); 6] = [
            ("invalid argument: ", Self::InvalidArgument),
            ("not found: ", Self::NotFound),
            ("remote failure: ", Self::RemoteFailure),
            ("timed out: ", Self::Timeout),
            ("rollback failed: ", Self::PartialRollback),
            ("invalid scenario: ", Self::InvalidScenario),
        ];
        for (prefix, variant) in prefixed {
            if let Some(rest) = msg.strip_prefix(prefix) {
                return variant(rest.to_string());
            }
        }
        if let Some((assertion, message)) = msg
            .strip_prefix("assertion ")
            .and_then(|rest| rest.split_once(" failed: "))
        {
            return Self::AssertionFailed {
                assertion: assertion.to_string(),
                message: message.to_string(),
            };
        }
        Self::RemoteFailure(msg.to_string())
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ChaosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ChaosError::remote("iptables exit 4").is_retryable());
        assert!(ChaosError::Timeout("step".into()).is_retryable());
        assert!(!ChaosError::invalid_argument("source").is_retryable());
        assert!(!ChaosError::not_found("server-9").is_retryable());
        assert!(!ChaosError::Cancelled.is_retryable());
        assert!(!ChaosError::PartialRollback("x".into()).is_retryable());
        assert!(
            ChaosError::AssertionFailed {
                assertion: "leader-elected".into(),
                message: "no leader".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = ChaosError::remote("exit 1").context("adding rules on server-0");
        assert_eq!(
            err,
            ChaosError::RemoteFailure("adding rules on server-0: exit 1".into())
        );
        assert_eq!(ChaosError::Cancelled.context("wait"), ChaosError::Cancelled);
    }

    #[test]
    fn test_from_message_inverts_display() {
        let errors = [
            ChaosError::invalid_argument("signal must be TERM or KILL"),
            ChaosError::not_found("server \"server-9\""),
            ChaosError::remote("removing rules on server-1: exit 4"),
            ChaosError::Timeout("step new leader".into()),
            ChaosError::Cancelled,
            ChaosError::PartialRollback("partition: exit 4".into()),
            ChaosError::InvalidScenario("no steps".into()),
            ChaosError::AssertionFailed {
                assertion: "leader-elected".into(),
                message: "no leader failed: twice".into(),
            },
        ];
        for err in errors {
            assert_eq!(ChaosError::from_message(&err.to_string()), err);
        }
        assert_eq!(
            ChaosError::from_message("something else"),
            ChaosError::remote("something else")
        );
    }

    #[test]
    fn test_display_already_registered() {
        let err = ChaosError::AlreadyRegistered {
            kind: "action",
            name: "partition".into(),
        };
        assert_eq!(err.to_string(), "action \"partition\" already registered");
    }
}
