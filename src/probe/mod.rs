//! Probe workloads
//!
//! A probe is a short-lived pod that runs one command against the system
//! under test and terminates. Its exit code and output are what Then-phase
//! checks judge.
//!
//! # Example
//!
//! ```ignore
//! let result = ctx
//!     .probe()
//!     .run_command(
//!         "quay.io/brancz/krp-curl:v0.0.2",
//!         "kube-rbac-proxy-client",
//!         &shell("curl --fail -k https://kube-rbac-proxy.default.svc:8443/metrics"),
//!         Some(&RunOptions::token_audience("kube-rbac-proxy")),
//!     )
//!     .await?;
//! assert!(result.succeeded());
//! ```

mod guard;

pub use crate::client::{CERT_MOUNT_DIR, TOKEN_FILE, TOKEN_MOUNT_DIR};
pub use guard::WorkloadGuard;

use crate::client::{
    ClientError, ClusterClient, Credentials, ResourceRef, ResourceStatus, WorkloadHandle,
    WorkloadOutput, WorkloadPhase, WorkloadSpec,
};
use crate::poll::{Attempt, ConditionError, PollError, Poller};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exit code reported for a probe that did not terminate in time
pub const TIMED_OUT_EXIT_CODE: i32 = -1;

/// Label put on every probe pod
pub const PROBE_LABEL: &str = "proxy-e2e/probe";

/// Credentials handed to a probe beyond the default service-account token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Mount a projected token bound to this audience
    pub token_audience: Option<String>,
    /// Mount the suite's client certificate secret
    pub client_certificates: bool,
}

impl RunOptions {
    #[must_use]
    pub fn token_audience(audience: impl Into<String>) -> Self {
        Self {
            token_audience: Some(audience.into()),
            client_certificates: false,
        }
    }

    #[must_use]
    pub fn client_certificates() -> Self {
        Self {
            token_audience: None,
            client_certificates: true,
        }
    }
}

/// Outcome of one probe run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub exit_code: i32,
    /// Container log
    pub stdout: Vec<u8>,
    /// Container termination message
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ProbeResult {
    /// Exit code 0 within the deadline
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Error type for probe runs
///
/// A probe that runs and fails is not an error: it is a [`ProbeResult`] with
/// a non-zero exit code. These are failures to run the probe at all.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe: {0}")]
    Invalid(String),

    #[error("failed to start probe {name}: {source}")]
    Start {
        name: String,
        #[source]
        source: ClientError,
    },

    #[error("probe {workload} aborted: {reason}")]
    Aborted { workload: String, reason: String },

    #[error("failed to read output of probe {workload}: {source}")]
    Output {
        workload: String,
        #[source]
        source: ClientError,
    },
}

/// Wrap a shell snippet as a probe command
#[must_use]
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.into()]
}

/// Launches probe workloads and collects their results
#[derive(Clone)]
pub struct ProbeExecutor {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    timeout: Duration,
    interval: Duration,
    client_cert_secret: String,
    service_account: Option<String>,
}

impl ProbeExecutor {
    pub fn new(client: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(1),
            client_cert_secret: crate::config::DEFAULT_CLIENT_CERT_SECRET.to_string(),
            service_account: None,
        }
    }

    /// Deadline for the probe to terminate
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cadence of completion polling
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Secret mounted for [`RunOptions::client_certificates`]
    #[must_use]
    pub fn client_cert_secret(mut self, secret: &str) -> Self {
        self.client_cert_secret = secret.to_string();
        self
    }

    /// Service account the probe pod runs as
    #[must_use]
    pub fn service_account(mut self, account: Option<String>) -> Self {
        self.service_account = account;
        self
    }

    /// Run `command` in a fresh pod and wait for it to terminate
    ///
    /// The pod is deleted on every path out of this function. A probe that
    /// does not terminate within the timeout yields a result with
    /// `timed_out` set and exit code [`TIMED_OUT_EXIT_CODE`].
    pub async fn run_command(
        &self,
        image: &str,
        name_prefix: &str,
        command: &[String],
        opts: Option<&RunOptions>,
    ) -> Result<ProbeResult, ProbeError> {
        let spec = self.workload_spec(image, name_prefix, command, opts)?;
        let name = spec.name.clone();

        debug!(
            namespace = %self.namespace,
            pod = %name,
            image = %image,
            "Starting probe"
        );

        // A failed create may still have left a pod behind, so the guard is
        // armed before the request goes out.
        let guard = WorkloadGuard::new(
            self.client.clone(),
            WorkloadHandle {
                namespace: spec.namespace.clone(),
                name: name.clone(),
            },
        );

        let handle = match self.client.create_workload(&spec).await {
            Ok(handle) => handle,
            Err(source) => {
                guard.release().await;
                return Err(ProbeError::Start { name, source });
            }
        };

        let result = self.observe(&handle).await;
        guard.release().await;

        if let Ok(result) = &result {
            info!(
                namespace = %self.namespace,
                pod = %handle.name,
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                "Probe finished"
            );
        }

        result
    }

    fn workload_spec(
        &self,
        image: &str,
        name_prefix: &str,
        command: &[String],
        opts: Option<&RunOptions>,
    ) -> Result<WorkloadSpec, ProbeError> {
        if image.trim().is_empty() {
            return Err(ProbeError::Invalid("image cannot be empty".to_string()));
        }
        if command.is_empty() {
            return Err(ProbeError::Invalid("command cannot be empty".to_string()));
        }
        validate_prefix(name_prefix)?;

        let credentials = match opts {
            Some(RunOptions {
                client_certificates: true,
                token_audience: Some(_),
            }) => {
                return Err(ProbeError::Invalid(
                    "token audience and client certificates are mutually exclusive".to_string(),
                ));
            }
            Some(RunOptions {
                client_certificates: true,
                ..
            }) => Credentials::ClientCertificate {
                secret: self.client_cert_secret.clone(),
            },
            Some(RunOptions {
                token_audience: Some(audience),
                ..
            }) => Credentials::AudienceToken {
                audience: audience.clone(),
            },
            _ => Credentials::ServiceAccount,
        };

        let mut labels = BTreeMap::new();
        labels.insert(PROBE_LABEL.to_string(), name_prefix.to_string());

        Ok(WorkloadSpec {
            name: probe_name(name_prefix),
            namespace: self.namespace.clone(),
            image: image.to_string(),
            command: command.to_vec(),
            credentials,
            service_account: self.service_account.clone(),
            labels,
        })
    }

    /// Wait for termination, then collect output
    ///
    /// Output reads share the probe deadline. After a normal exit the read
    /// gets what is left of it, at least one interval; after a timeout it
    /// gets one interval.
    async fn observe(&self, handle: &WorkloadHandle) -> Result<ProbeResult, ProbeError> {
        let deadline = Instant::now() + self.timeout;
        let poller = Poller::new(self.interval, self.timeout);
        let resource = handle.to_string();
        let status_ref = ResourceRef::Workload(handle.clone());

        let exit = poller
            .until(&resource, || async {
                match self.client.status(&status_ref).await? {
                    ResourceStatus::Workload(WorkloadPhase::Terminated { exit_code }) => {
                        Ok(Attempt::Done(exit_code))
                    }
                    ResourceStatus::Workload(phase) => Ok(Attempt::Pending(phase.to_string())),
                    other => Err(ConditionError::Fatal(format!(
                        "unexpected status for workload: {other}"
                    ))),
                }
            })
            .await;

        match exit {
            Ok(exit_code) => {
                let budget = deadline
                    .saturating_duration_since(Instant::now())
                    .max(self.interval);
                let output = self
                    .read_output(handle, budget)
                    .await
                    .map_err(|source| ProbeError::Output {
                        workload: resource.clone(),
                        source,
                    })?;

                Ok(ProbeResult {
                    exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    timed_out: false,
                })
            }
            Err(PollError::Timeout(wait)) => {
                warn!(
                    namespace = %self.namespace,
                    pod = %handle.name,
                    last_state = %wait.last_state,
                    "Probe did not terminate in time"
                );

                let output = match self.read_output(handle, self.interval).await {
                    Ok(output) => output,
                    Err(e) => {
                        debug!(pod = %handle.name, error = %e, "No output from timed out probe");
                        WorkloadOutput::default()
                    }
                };

                Ok(ProbeResult {
                    exit_code: TIMED_OUT_EXIT_CODE,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    timed_out: true,
                })
            }
            Err(PollError::Aborted { reason, .. }) => Err(ProbeError::Aborted {
                workload: resource,
                reason,
            }),
        }
    }

    async fn read_output(
        &self,
        handle: &WorkloadHandle,
        budget: Duration,
    ) -> Result<WorkloadOutput, ClientError> {
        tokio::time::timeout(budget, self.client.workload_output(handle))
            .await
            .map_err(|_| {
                ClientError::Api(format!("reading logs of {handle} took longer than {budget:?}"))
            })?
    }
}

impl std::fmt::Debug for ProbeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeExecutor")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .field("client_cert_secret", &self.client_cert_secret)
            .field("service_account", &self.service_account)
            .finish_non_exhaustive()
    }
}

/// `<prefix>-<8 hex chars>`
fn probe_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

/// The prefix plus a 9 character suffix must stay a valid pod name
fn validate_prefix(prefix: &str) -> Result<(), ProbeError> {
    let valid = !prefix.is_empty()
        && prefix.len() <= 63 - 9
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && prefix.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(ProbeError::Invalid(format!(
            "'{prefix}' is not a valid pod name prefix"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;

    const IMAGE: &str = "quay.io/brancz/krp-curl:v0.0.2";

    fn executor(fake: &Arc<FakeCluster>) -> ProbeExecutor {
        ProbeExecutor::new(fake.clone(), "default")
            .interval(Duration::from_millis(5))
            .timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_probe_name_has_random_suffix() {
        let name = probe_name("kube-rbac-proxy-client");
        let (prefix, suffix) = name.rsplit_once('-').unwrap();

        assert_eq!(prefix, "kube-rbac-proxy-client");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, probe_name("kube-rbac-proxy-client"));
    }

    #[test]
    fn test_shell_wraps_script() {
        assert_eq!(shell("exit 3"), vec!["/bin/sh", "-c", "exit 3"]);
    }

    #[tokio::test]
    async fn test_run_command_success() {
        let fake = Arc::new(
            FakeCluster::new()
                .workload_exit("client", 0)
                .workload_output(
                    "client",
                    WorkloadOutput {
                        stdout: b"ok".to_vec(),
                        stderr: Vec::new(),
                    },
                ),
        );

        let result = executor(&fake)
            .run_command(IMAGE, "client", &shell("curl --fail http://svc"), None)
            .await
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.stdout_lossy(), "ok");
        assert_eq!(fake.workload_deletions().len(), 1);

        let created = fake.created_workloads();
        assert_eq!(created.len(), 1);
        assert!(created[0].name.starts_with("client-"));
        assert_eq!(created[0].credentials, Credentials::ServiceAccount);
    }

    #[tokio::test]
    async fn test_run_command_failure_is_a_result() {
        let fake = Arc::new(FakeCluster::new().workload_exit("client", 22));

        let result = executor(&fake)
            .run_command(IMAGE, "client", &shell("curl --fail http://svc"), None)
            .await
            .unwrap();

        assert_eq!(result.exit_code, 22);
        assert!(!result.timed_out);
        assert!(!result.succeeded());
        assert_eq!(fake.workload_deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let fake = Arc::new(FakeCluster::new().workload_hangs("sleeper"));

        let result = executor(&fake)
            .timeout(Duration::from_millis(30))
            .run_command(IMAGE, "sleeper", &shell("sleep 3600"), None)
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMED_OUT_EXIT_CODE);
        assert_eq!(fake.workload_deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_run_command_injects_credentials() {
        let fake = Arc::new(FakeCluster::new().workload_exit("client", 0));
        let probe = executor(&fake).client_cert_secret("client-certs");

        probe
            .run_command(
                IMAGE,
                "client",
                &shell("true"),
                Some(&RunOptions::token_audience("kube-rbac-proxy")),
            )
            .await
            .unwrap();
        probe
            .run_command(
                IMAGE,
                "client",
                &shell("true"),
                Some(&RunOptions::client_certificates()),
            )
            .await
            .unwrap();

        let created = fake.created_workloads();
        assert_eq!(
            created[0].credentials,
            Credentials::AudienceToken {
                audience: "kube-rbac-proxy".to_string()
            }
        );
        assert_eq!(
            created[1].credentials,
            Credentials::ClientCertificate {
                secret: "client-certs".to_string()
            }
        );
        assert_eq!(fake.workload_deletions().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_probe_creates_nothing() {
        let fake = Arc::new(FakeCluster::new());

        let err = executor(&fake)
            .run_command(IMAGE, "Bad_Prefix", &shell("true"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Invalid(_)));

        let err = executor(&fake)
            .run_command(IMAGE, "client", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Invalid(_)));

        assert!(fake.created_workloads().is_empty());
    }

    #[tokio::test]
    async fn test_output_failure_still_deletes_pod() {
        let fake = Arc::new(
            FakeCluster::new()
                .workload_exit("client", 0)
                .fail_workload_output(),
        );

        let err = executor(&fake)
            .run_command(IMAGE, "client", &shell("true"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Output { .. }));
        assert_eq!(fake.workload_deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_probe_does_not_wait_for_logs() {
        let fake = Arc::new(
            FakeCluster::new()
                .workload_hangs("sleeper")
                .hang_workload_output(),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            executor(&fake)
                .timeout(Duration::from_millis(50))
                .run_command(IMAGE, "sleeper", &shell("sleep 3600"), None),
        )
        .await
        .expect("probe outlived its deadline")
        .unwrap();

        assert!(result.timed_out);
        assert!(result.stdout.is_empty());
        assert_eq!(fake.workload_deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_log_read_is_an_output_error() {
        let fake = Arc::new(
            FakeCluster::new()
                .workload_exit("client", 0)
                .hang_workload_output(),
        );

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            executor(&fake)
                .timeout(Duration::from_millis(50))
                .run_command(IMAGE, "client", &shell("true"), None),
        )
        .await
        .expect("probe outlived its deadline")
        .unwrap_err();

        assert!(matches!(err, ProbeError::Output { .. }));
        assert_eq!(fake.workload_deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_create_still_deletes_pod() {
        let fake = Arc::new(FakeCluster::new().fail_workload_creation());

        let err = executor(&fake)
            .run_command(IMAGE, "client", &shell("true"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Start { .. }));
        let created = fake.created_workloads();
        assert_eq!(created.len(), 1);
        assert_eq!(
            fake.workload_deletions(),
            vec![WorkloadHandle {
                namespace: "default".to_string(),
                name: created[0].name.clone(),
            }]
        );
    }
}
