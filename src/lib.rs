//! proxy-e2e - declarative end-to-end scenarios for kube-rbac-proxy
//!
//! Scenarios are written as Given/When/Then steps against a live cluster:
//! apply manifests, wait until pods and services are ready, then run probe
//! pods that call the proxy and check whether they succeed or fail.
//!
//! # Example
//!
//! ```ignore
//! use proxy_e2e::prelude::*;
//!
//! #[proxy_e2e::test]
//! #[ignore]
//! async fn allow_path(suite: Suite) -> Result<(), ScenarioError> {
//!     suite
//!         .scenario(
//!             "WithAllowPath",
//!             "As a client with the correct RBAC rules,
//!              I succeed with 200 OK when accessing an allowed path",
//!         )
//!         .given(created_manifests([
//!             "allowpaths/clusterRole.yaml",
//!             "allowpaths/clusterRoleBinding.yaml",
//!             "allowpaths/deployment.yaml",
//!             "allowpaths/service.yaml",
//!             "allowpaths/serviceAccount.yaml",
//!         ]))
//!         .when(pods_are_ready(1, "app=kube-rbac-proxy"))
//!         .when(service_is_ready("kube-rbac-proxy"))
//!         .then(run_succeeds(
//!             "kube-rbac-proxy-client",
//!             shell("curl --connect-timeout 5 -v -s -k --fail \
//!                    -H \"Authorization: Bearer $(cat /var/run/secrets/kubernetes.io/serviceaccount/token)\" \
//!                    https://kube-rbac-proxy.default.svc.cluster.local:8443/metrics"),
//!         ))
//!         .run()
//!         .await
//! }
//! ```
//!
//! # Configuration
//!
//! `Suite::from_env()` reads `E2E_NAMESPACE`, `E2E_PROBE_IMAGE`,
//! `E2E_MANIFEST_DIR`, `E2E_CLIENT_CERT_SECRET`, `E2E_PROBE_SERVICE_ACCOUNT`,
//! `E2E_CONDITION_TIMEOUT_SECS`, `E2E_PROBE_TIMEOUT_SECS` and
//! `E2E_KEEP_RESOURCES`. Logging honours `RUST_LOG`.

pub mod check;
pub mod client;
pub mod condition;
pub mod config;
pub mod context;
pub mod poll;
pub mod probe;
pub mod scenario;
pub mod setup;
pub mod suite;
pub mod telemetry;
pub mod testing;
pub mod wait;

// Re-export commonly used types
pub use check::{expect_failure, expect_success, run_fails, run_succeeds, Check, CheckError, Expectation, RunCheck};
pub use client::{ClientError, ClusterClient, KubeClient, Manifest, ManifestError};
pub use condition::{pods_are_ready, service_is_ready, Condition};
pub use config::{ConfigError, SuiteConfig};
pub use context::ScenarioContext;
pub use poll::{ConditionError, PollError, Poller, Readiness};
pub use probe::{shell, ProbeError, ProbeExecutor, ProbeResult, RunOptions};
pub use scenario::{Outcome, Phase, Scenario, ScenarioError, ScenarioReport, StepError};
pub use setup::{apply_manifests, created_manifests, Setup, SetupError};
pub use suite::{Suite, SuiteError, SuiteReport};
pub use telemetry::init_logging;
pub use wait::WaitError;

/// Attribute macro for scenario tests
///
/// Builds a [`Suite`] from the environment, initializes logging and passes
/// the suite to the test as its only argument.
///
/// ```ignore
/// #[proxy_e2e::test]
/// #[ignore]
/// async fn no_rbac(suite: proxy_e2e::Suite) {
///     // ...
/// }
/// ```
pub use proxy_e2e_macros::test;

/// Everything a scenario file usually needs
pub mod prelude {
    pub use crate::check::{run_fails, run_succeeds, Check};
    pub use crate::condition::{pods_are_ready, service_is_ready, Condition};
    pub use crate::probe::{shell, RunOptions};
    pub use crate::scenario::{Scenario, ScenarioError};
    pub use crate::setup::{created_inline, created_manifests, Setup};
    pub use crate::suite::Suite;
}
