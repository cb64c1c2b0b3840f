//! Run context: cooperative cancellation plus an optional deadline.
//!
//! Every suspension point in the engine (remote commands, polling waits,
//! wait steps, retry backoff) is bounded by a [`RunContext`]. Children made
//! with [`RunContext::with_timeout`] share the parent's cancel signal and can
//! only shorten its deadline.

use crate::error::{ChaosError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Handle that cancels every context derived from the same root.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl RunContext {
    /// Create a root context and the handle that cancels it.
    pub fn new() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancel: Some(rx),
                deadline: None,
            },
            CancelHandle { tx: Arc::new(tx) },
        )
    }

    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            cancel: None,
            deadline: None,
        }
    }

    /// Child context whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// Like [`with_timeout`](Self::with_timeout) but a `None` timeout inherits the parent as is.
    pub fn with_optional_timeout(&self, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => self.with_timeout(timeout),
            None => self.clone(),
        }
    }

    /// Fresh context that ignores this context's cancellation.
    ///
    /// Teardown runs under a detached context so that faults injected by a
    /// cancelled run are still reversed.
    pub fn detached(timeout: Duration) -> Self {
        Self {
            cancel: None,
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<ChaosError> {
        if self.is_cancelled() {
            return Some(ChaosError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(deadline_exceeded()),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ChaosError {
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Every handle dropped: nobody can cancel any more.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => ChaosError::Cancelled,
            _ = expired => deadline_exceeded(),
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }

    /// Sleep for `duration`, returning early with the interrupt reason.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::background()
    }
}

fn deadline_exceeded() -> ChaosError {
    ChaosError::Timeout("deadline exceeded".to_string())
}
