//! Rich wait errors with debugging context
//!
//! Provides detailed error information when a readiness wait times out.
//!
//! # Example
//!
//! ```ignore
//! match poller.wait_for("pods[app=kube-rbac-proxy]", check).await {
//!     Err(PollError::Timeout(err)) => {
//!         println!("Resource: {}", err.resource);
//!         println!("Last state: {}", err.last_state);
//!         println!("Attempts: {}", err.attempts);
//!     }
//!     _ => {}
//! }
//! ```

use std::fmt;
use std::time::Duration;

/// Rich error context for wait operations
#[derive(Debug, Clone)]
pub struct WaitError {
    /// What was being waited on (e.g., "service/kube-rbac-proxy in default")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
    /// How many times the condition was evaluated
    pub attempts: u32,
}

impl WaitError {
    /// Create a new WaitError
    pub fn new(resource: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self {
            resource: resource.into(),
            last_state: "unknown".to_string(),
            elapsed,
            timeout,
            attempts: 0,
        }
    }

    /// Set the last observed state
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }

    /// Set the number of evaluation attempts
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}", self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Attempts: {}", self.attempts)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        write!(f, "└─ Timeout: {:?}", self.timeout)
    }
}

impl std::error::Error for WaitError {}
