//! The suite handle
//!
//! A [`Suite`] is built once per test binary or test function and shared
//! read-only by every scenario. It holds the cluster client and the shared
//! configuration; there is no global instance.

use crate::client::{ClientError, ClusterClient, KubeClient};
use crate::config::{ConfigError, SuiteConfig};
use crate::scenario::{Scenario, ScenarioReport};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Error type for suite construction
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Shared, immutable handle to the cluster and suite configuration
#[derive(Clone)]
pub struct Suite {
    client: Arc<dyn ClusterClient>,
    config: Arc<SuiteConfig>,
}

impl Suite {
    pub fn new(client: Arc<dyn ClusterClient>, config: SuiteConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    /// Connect with the ambient kubeconfig and read configuration from the
    /// environment
    ///
    /// # Errors
    ///
    /// Returns `SuiteError` if an environment variable is malformed or no
    /// cluster is reachable.
    pub async fn from_env() -> Result<Self, SuiteError> {
        let config = SuiteConfig::from_env()?;
        let client = KubeClient::try_default().await?;

        info!(
            namespace = %config.namespace,
            manifest_dir = %config.manifest_dir.display(),
            "Suite ready"
        );

        Ok(Self::new(Arc::new(client), config))
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub(crate) fn config_arc(&self) -> Arc<SuiteConfig> {
        self.config.clone()
    }

    /// Start building a scenario
    pub fn scenario(&self, name: impl Into<String>, description: impl AsRef<str>) -> Scenario {
        Scenario::new(self, name, description)
    }

    /// Run scenarios one after another, continuing past failures
    ///
    /// A scenario whose name repeats an earlier one is not run and is
    /// reported as failed.
    pub async fn run_all(&self, scenarios: impl IntoIterator<Item = Scenario>) -> SuiteReport {
        let mut seen = HashSet::new();
        let mut reports = Vec::new();

        for scenario in scenarios {
            if !seen.insert(scenario.name().to_string()) {
                warn!(scenario = %scenario.name(), "Duplicate scenario name, skipping");
                reports.push(ScenarioReport {
                    name: scenario.name().to_string(),
                    description: scenario.description().to_string(),
                    outcome: crate::scenario::Outcome::Failed(format!(
                        "duplicate scenario name '{}'",
                        scenario.name()
                    )),
                    duration: Duration::ZERO,
                });
                continue;
            }

            reports.push(scenario.run_reported().await);
        }

        let report = SuiteReport { scenarios: reports };
        info!(
            passed = report.passed_count(),
            failed = report.failed_count(),
            "Suite finished"
        );
        report
    }
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Results of [`Suite::run_all`], in run order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteReport {
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.scenarios.iter().all(ScenarioReport::passed)
    }

    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.scenarios.iter().filter(|r| r.passed()).count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.scenarios.len() - self.passed_count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.scenarios.iter().filter(|r| !r.passed())
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.scenarios {
            writeln!(f, "{report}")?;
        }
        write!(
            f,
            "{} passed, {} failed",
            self.passed_count(),
            self.failed_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{run_fails, run_succeeds};
    use crate::probe::shell;
    use crate::testing::FakeCluster;

    fn suite(fake: FakeCluster) -> Suite {
        let config = SuiteConfig::new()
            .probe_interval(Duration::from_millis(5))
            .probe_timeout(Duration::from_millis(100));
        Suite::new(Arc::new(fake), config)
    }

    #[tokio::test]
    async fn test_run_all_continues_past_failures() {
        let suite = suite(FakeCluster::new().workload_exit("client", 22));

        let report = suite
            .run_all([
                suite
                    .scenario("first", "expects success")
                    .then(run_succeeds("client", shell("curl --fail http://svc"))),
                suite
                    .scenario("second", "expects failure")
                    .then(run_fails("client", shell("curl --fail http://svc"))),
            ])
            .await;

        assert_eq!(report.scenarios.len(), 2);
        assert!(!report.scenarios[0].passed());
        assert!(report.scenarios[1].passed());
        assert_eq!(report.failed_count(), 1);
        assert!(!report.all_passed());
        assert!(report.to_string().ends_with("1 passed, 1 failed"));
    }

    #[tokio::test]
    async fn test_run_all_rejects_duplicate_names() {
        let suite = suite(FakeCluster::new());

        let report = suite
            .run_all([
                suite.scenario("same", "first"),
                suite.scenario("same", "second"),
            ])
            .await;

        assert!(report.scenarios[0].passed());
        assert!(report.scenarios[1]
            .diagnostic()
            .unwrap()
            .contains("duplicate scenario name"));
    }

    #[tokio::test]
    async fn test_suite_is_shared_across_tasks() {
        let suite = suite(FakeCluster::new().workload_exit("client", 0));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let suite = suite.clone();
                tokio::spawn(async move {
                    suite
                        .scenario(format!("parallel-{i}"), "runs concurrently")
                        .then(run_succeeds("client", shell("true")))
                        .run()
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[test]
    fn test_config_is_read_only_view() {
        let suite = suite(FakeCluster::new());
        assert_eq!(suite.config().namespace, "default");
    }
}
