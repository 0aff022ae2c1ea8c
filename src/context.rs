//! Scenario-scoped state
//!
//! A [`ScenarioContext`] is created when a scenario starts running and
//! dropped when it finishes. Setups record what they created here so it can
//! be removed afterwards.

use crate::client::{ClusterClient, ResourceHandle};
use crate::config::SuiteConfig;
use crate::probe::ProbeExecutor;
use std::sync::Arc;
use tracing::{info, warn};

/// Mutable state threaded through every step of one scenario run
pub struct ScenarioContext {
    scenario: String,
    namespace: String,
    client: Arc<dyn ClusterClient>,
    config: Arc<SuiteConfig>,
    created: Vec<ResourceHandle>,
}

impl ScenarioContext {
    pub fn new(
        scenario: impl Into<String>,
        client: Arc<dyn ClusterClient>,
        config: Arc<SuiteConfig>,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            namespace: config.namespace.clone(),
            client,
            config,
            created: Vec::new(),
        }
    }

    /// Name of the running scenario
    #[must_use]
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Namespace this scenario works in
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Record objects to delete when the scenario ends
    pub fn track(&mut self, handles: impl IntoIterator<Item = ResourceHandle>) {
        self.created.extend(handles);
    }

    /// Objects created so far, in creation order
    #[must_use]
    pub fn created(&self) -> &[ResourceHandle] {
        &self.created
    }

    /// A probe executor bound to this scenario's client and settings
    #[must_use]
    pub fn probe(&self) -> ProbeExecutor {
        ProbeExecutor::new(self.client.clone(), &self.namespace)
            .timeout(self.config.probe_timeout)
            .interval(self.config.probe_interval)
            .client_cert_secret(&self.config.client_cert_secret)
            .service_account(self.config.probe_service_account.clone())
    }

    /// Delete every tracked object, newest first
    ///
    /// Failures are logged and never returned: they must not mask the
    /// scenario's own result.
    pub async fn cleanup(&mut self) {
        let created = std::mem::take(&mut self.created);

        if self.config.keep_resources {
            info!(
                scenario = %self.scenario,
                count = created.len(),
                "Keeping scenario resources"
            );
            return;
        }

        for handle in created.iter().rev() {
            if let Err(e) = self.client.delete(handle).await {
                warn!(
                    scenario = %self.scenario,
                    resource = %handle,
                    error = %e,
                    "Failed to delete scenario resource"
                );
            }
        }
    }
}

impl std::fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("scenario", &self.scenario)
            .field("namespace", &self.namespace)
            .field("created", &self.created.len())
            .finish_non_exhaustive()
    }
}
