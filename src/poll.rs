//! Condition polling
//!
//! [`Poller`] evaluates a predicate right away and then at a fixed interval
//! until it is satisfied, it reports a fatal error, or the timeout elapses.
//!
//! # Example
//!
//! ```ignore
//! use proxy_e2e::poll::{Poller, Readiness};
//! use std::time::Duration;
//!
//! Poller::new(Duration::from_secs(1), Duration::from_secs(60))
//!     .wait_for("service/kube-rbac-proxy", || async {
//!         if endpoints().await? > 0 {
//!             Ok(Readiness::Satisfied)
//!         } else {
//!             Ok(Readiness::NotYet("no endpoints".to_string()))
//!         }
//!     })
//!     .await?;
//! ```

use crate::client::ClientError;
use crate::wait::WaitError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Result of a single condition evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Satisfied,
    /// Not there yet; carries the observed state for diagnostics
    NotYet(String),
}

/// Result of a single poll attempt that yields a value once done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    Pending(String),
}

/// Error raised while evaluating a condition
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConditionError {
    /// Cluster state that may still change; retried until timeout
    #[error("{0}")]
    Transient(String),

    /// Programming or configuration fault; aborts the wait immediately
    #[error("{0}")]
    Fatal(String),
}

impl From<ClientError> for ConditionError {
    fn from(err: ClientError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

/// Error type for poll operations
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("{0}")]
    Timeout(#[from] WaitError),

    #[error("wait for {resource} aborted: {reason}")]
    Aborted { resource: String, reason: String },
}

/// Fixed-cadence poller with an overall deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
}

impl Poller {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until `predicate` reports [`Readiness::Satisfied`]
    ///
    /// Returns the number of evaluations it took.
    pub async fn wait_for<F, Fut>(&self, resource: &str, mut predicate: F) -> Result<u32, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Readiness, ConditionError>>,
    {
        let mut attempts = 0u32;

        self.until(resource, || {
            attempts += 1;
            let evaluation = predicate();
            async move {
                Ok::<_, ConditionError>(match evaluation.await? {
                    Readiness::Satisfied => Attempt::Done(()),
                    Readiness::NotYet(state) => Attempt::Pending(state),
                })
            }
        })
        .await?;

        Ok(attempts)
    }

    /// Poll until `attempt` yields a value
    ///
    /// The first evaluation happens immediately, so even a zero timeout gets
    /// one attempt. Each evaluation is bounded by the remaining budget plus
    /// one interval, which keeps the whole wait within `timeout + interval`.
    pub async fn until<T, F, Fut>(&self, resource: &str, mut attempt: F) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt<T>, ConditionError>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last_state = "not evaluated".to_string();

        loop {
            attempts += 1;
            let budget = self.timeout.saturating_sub(start.elapsed()) + self.interval;

            match timeout(budget, attempt()).await {
                Ok(Ok(Attempt::Done(value))) => {
                    debug!(
                        resource = %resource,
                        attempts = attempts,
                        elapsed = ?start.elapsed(),
                        "Condition met"
                    );
                    return Ok(value);
                }
                Ok(Ok(Attempt::Pending(state))) => {
                    debug!(
                        resource = %resource,
                        state = %state,
                        elapsed = ?start.elapsed(),
                        "Condition not met yet, waiting..."
                    );
                    last_state = state;
                }
                Ok(Err(ConditionError::Transient(reason))) => {
                    debug!(
                        resource = %resource,
                        error = %reason,
                        elapsed = ?start.elapsed(),
                        "Transient error while polling, waiting..."
                    );
                    last_state = reason;
                }
                Ok(Err(ConditionError::Fatal(reason))) => {
                    return Err(PollError::Aborted {
                        resource: resource.to_string(),
                        reason,
                    });
                }
                Err(_) => {
                    last_state = format!("evaluation did not finish within {budget:?}");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(WaitError::new(resource, self.timeout, elapsed)
                    .with_state(last_state)
                    .with_attempts(attempts)
                    .into());
            }

            sleep(self.interval.min(self.timeout - elapsed)).await;
        }
    }
}
