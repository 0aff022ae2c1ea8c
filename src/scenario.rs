//! Given/When/Then scenarios
//!
//! A scenario is a named list of steps in three phases. Given steps set up
//! cluster state, When steps wait for it to become ready, Then steps probe
//! the system and judge the outcome. The first failing step ends the run.
//!
//! # Example
//!
//! ```ignore
//! use proxy_e2e::prelude::*;
//!
//! #[proxy_e2e::test]
//! #[ignore]
//! async fn no_rbac(suite: Suite) -> Result<(), ScenarioError> {
//!     suite
//!         .scenario(
//!             "NoRBAC",
//!             "As a client without any RBAC rule access,
//!              I fail with 401 Unauthorized when accessing /metrics",
//!         )
//!         .given(created_manifests([
//!             "basics/clusterRole.yaml",
//!             "basics/clusterRoleBinding.yaml",
//!             "basics/deployment.yaml",
//!             "basics/service.yaml",
//!             "basics/serviceAccount.yaml",
//!         ]))
//!         .when(pods_are_ready(1, "app=kube-rbac-proxy"))
//!         .when(service_is_ready("kube-rbac-proxy"))
//!         .then(run_fails("kube-rbac-proxy-client", shell(METRICS_CURL)))
//!         .run()
//!         .await
//! }
//! ```

use crate::check::{Check, CheckError};
use crate::client::ClusterClient;
use crate::condition::{await_condition, Condition};
use crate::config::SuiteConfig;
use crate::context::ScenarioContext;
use crate::poll::PollError;
use crate::setup::{Setup, SetupError};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// The three phases of a scenario, in run order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Given,
    When,
    Then,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Given => f.write_str("Given"),
            Self::When => f.write_str("When"),
            Self::Then => f.write_str("Then"),
        }
    }
}

/// Why a single step failed
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Condition(#[from] PollError),

    #[error(transparent)]
    Check(#[from] CheckError),

    #[error("step panicked: {0}")]
    Panicked(String),
}

/// A failed scenario run
///
/// Displays as one block naming the scenario, what it is about, and the
/// failing step with its diagnostic.
#[derive(Debug, thiserror::Error)]
#[error(
    "scenario '{name}' failed at {phase} step {step} ({label})\n  {description}\n\n{source}"
)]
pub struct ScenarioError {
    pub name: String,
    pub description: String,
    pub phase: Phase,
    /// 1-based index within the phase
    pub step: usize,
    pub label: String,
    #[source]
    pub source: StepError,
}

/// Final state of one scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    /// Carries the rendered [`ScenarioError`]
    Failed(String),
}

/// Summary of one scenario run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub name: String,
    pub description: String,
    pub outcome: Outcome,
    pub duration: Duration,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    /// Diagnostic of a failed run
    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Passed => None,
            Outcome::Failed(diagnostic) => Some(diagnostic),
        }
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Passed => write!(
                f,
                "PASS {} ({:.1}s)\n  {}",
                self.name,
                self.duration.as_secs_f64(),
                self.description
            ),
            Outcome::Failed(diagnostic) => write!(
                f,
                "FAIL {} ({:.1}s)\n{diagnostic}",
                self.name,
                self.duration.as_secs_f64()
            ),
        }
    }
}

/// A named Given/When/Then test case
///
/// Immutable once built; [`run`](Self::run) consumes it.
pub struct Scenario {
    name: String,
    description: String,
    client: Arc<dyn ClusterClient>,
    config: Arc<SuiteConfig>,
    given: Vec<Box<dyn Setup>>,
    when: Vec<Box<dyn Condition>>,
    then: Vec<Box<dyn Check>>,
}

impl Scenario {
    /// Start a scenario against the suite's cluster and configuration
    pub fn new(
        suite: &crate::suite::Suite,
        name: impl Into<String>,
        description: impl AsRef<str>,
    ) -> Self {
        Self::with_client(
            suite.client().clone(),
            suite.config_arc(),
            name,
            description,
        )
    }

    pub(crate) fn with_client(
        client: Arc<dyn ClusterClient>,
        config: Arc<SuiteConfig>,
        name: impl Into<String>,
        description: impl AsRef<str>,
    ) -> Self {
        Self {
            name: name.into(),
            description: normalize_description(description.as_ref()),
            client,
            config,
            given: Vec::new(),
            when: Vec::new(),
            then: Vec::new(),
        }
    }

    /// Add a Given step
    #[must_use]
    pub fn given(mut self, setup: impl Setup + 'static) -> Self {
        self.given.push(Box::new(setup));
        self
    }

    /// Add a When step
    #[must_use]
    pub fn when(mut self, condition: impl Condition + 'static) -> Self {
        self.when.push(Box::new(condition));
        self
    }

    /// Add a Then step
    #[must_use]
    pub fn then(mut self, check: impl Check + 'static) -> Self {
        self.then.push(Box::new(check));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run every step in order, stopping at the first failure
    ///
    /// Resources created by Given steps are deleted afterwards whatever the
    /// outcome, including when a step panics.
    ///
    /// # Errors
    ///
    /// Returns `ScenarioError` describing the first failing step.
    pub async fn run(self) -> Result<(), ScenarioError> {
        let mut ctx = ScenarioContext::new(&self.name, self.client.clone(), self.config.clone());

        println!("\n📋 Scenario: {}", self.name);
        println!("   {}", self.description);

        let result = self.run_steps(&mut ctx).await;
        ctx.cleanup().await;

        match &result {
            Ok(()) => {
                println!("   ✅ Scenario passed\n");
                info!(scenario = %self.name, "Scenario passed");
            }
            Err(e) => {
                println!("   ❌ Scenario failed at {} step {}\n", e.phase, e.step);
                info!(
                    scenario = %self.name,
                    phase = %e.phase,
                    step = e.step,
                    "Scenario failed"
                );
            }
        }

        result
    }

    /// Run and summarize instead of returning an error
    pub async fn run_reported(self) -> ScenarioReport {
        let name = self.name.clone();
        let description = self.description.clone();
        let started = Instant::now();

        let outcome = match self.run().await {
            Ok(()) => Outcome::Passed,
            Err(e) => Outcome::Failed(e.to_string()),
        };

        ScenarioReport {
            name,
            description,
            outcome,
            duration: started.elapsed(),
        }
    }

    async fn run_steps(&self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        for (i, setup) in self.given.iter().enumerate() {
            let label = setup.describe();
            println!("   Given {label}");
            guarded(setup.apply(ctx))
                .await
                .map_err(|source| self.failure(Phase::Given, i, label, source))?;
        }

        for (i, condition) in self.when.iter().enumerate() {
            let label = condition.describe();
            println!("   When {label}");
            guarded(await_condition(ctx, condition.as_ref()))
                .await
                .map_err(|source| self.failure(Phase::When, i, label, source))?;
        }

        for (i, check) in self.then.iter().enumerate() {
            let label = check.describe();
            println!("   Then {label}");
            guarded(check.verify(ctx))
                .await
                .map_err(|source| self.failure(Phase::Then, i, label, source))?;
        }

        Ok(())
    }

    fn failure(&self, phase: Phase, index: usize, label: String, source: StepError) -> ScenarioError {
        ScenarioError {
            name: self.name.clone(),
            description: self.description.clone(),
            phase,
            step: index + 1,
            label,
            source,
        }
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("given", &self.given.len())
            .field("when", &self.when.len())
            .field("then", &self.then.len())
            .finish_non_exhaustive()
    }
}

/// Await a step, turning a panic into a step failure
async fn guarded<F, E>(step: F) -> Result<(), StepError>
where
    F: std::future::Future<Output = Result<(), E>>,
    E: Into<StepError>,
{
    match AssertUnwindSafe(step).catch_unwind().await {
        Ok(result) => result.map_err(Into::into),
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "step panicked".to_string()
            };
            Err(StepError::Panicked(msg))
        }
    }
}

/// Collapse line breaks and indentation from multi-line descriptions
fn normalize_description(description: &str) -> String {
    description.split_whitespace().collect::<Vec<_>>().join(" ")
}
