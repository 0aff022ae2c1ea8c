//! In-memory cluster for exercising scenarios without Kubernetes
//!
//! [`FakeCluster`] implements [`ClusterClient`] with scripted behaviour:
//! pod and service readiness, per-resource status sequences, probe exit
//! codes and output, and injected apply/delete failures. Everything it is
//! asked to do is recorded for assertions.
//!
//! # Example
//!
//! ```
//! use proxy_e2e::testing::FakeCluster;
//! use proxy_e2e::Suite;
//! use std::sync::Arc;
//!
//! let fake = FakeCluster::new()
//!     .pods("app=kube-rbac-proxy", 1, 1)
//!     .service("kube-rbac-proxy", 1)
//!     .workload_exit("kube-rbac-proxy-client", 22);
//! let suite = Suite::new(Arc::new(fake), Default::default());
//! ```

use crate::client::{
    ClientError, ClusterClient, Manifest, ResourceHandle, ResourceRef, ResourceStatus,
    WorkloadHandle, WorkloadOutput, WorkloadPhase, WorkloadSpec,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How a fake probe workload behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Exit(i32),
    Hang,
}

#[derive(Debug, Default)]
struct State {
    applied: Vec<String>,
    apply_calls: usize,
    deleted: Vec<ResourceHandle>,
    status_calls: HashMap<String, usize>,
    scripted: HashMap<String, VecDeque<Result<ResourceStatus, ClientError>>>,
    created_workloads: Vec<WorkloadSpec>,
    workload_deletions: Vec<WorkloadHandle>,
}

/// Scriptable in-memory [`ClusterClient`]
#[derive(Debug, Default)]
pub struct FakeCluster {
    pods: HashMap<String, (usize, usize)>,
    services: HashMap<String, usize>,
    behaviours: HashMap<String, Behaviour>,
    outputs: HashMap<String, WorkloadOutput>,
    failing_applies: HashSet<String>,
    failing_deletes: HashSet<String>,
    fail_workload_creation: bool,
    fail_workload_output: bool,
    hang_workload_output: bool,
    fail_workload_deletion: bool,
    state: Mutex<State>,
}

impl FakeCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `ready` of `total` pods for a selector
    #[must_use]
    pub fn pods(mut self, selector: &str, ready: usize, total: usize) -> Self {
        self.pods.insert(selector.to_string(), (ready, total));
        self
    }

    /// Report a service with `endpoints` ready addresses
    #[must_use]
    pub fn service(mut self, name: &str, endpoints: usize) -> Self {
        self.services.insert(name.to_string(), endpoints);
        self
    }

    /// Return these results, in order, for a resource keyed by its display
    /// form (`pods[app=x] in default`, `service/x in default`)
    ///
    /// The last result repeats once the sequence is exhausted.
    #[must_use]
    pub fn script_status(
        self,
        resource: &str,
        results: Vec<Result<ResourceStatus, ClientError>>,
    ) -> Self {
        self.lock()
            .scripted
            .insert(resource.to_string(), results.into());
        self
    }

    /// Probes whose name starts with `prefix` exit with `code`
    #[must_use]
    pub fn workload_exit(mut self, prefix: &str, code: i32) -> Self {
        self.behaviours
            .insert(prefix.to_string(), Behaviour::Exit(code));
        self
    }

    /// Probes whose name starts with `prefix` never terminate
    #[must_use]
    pub fn workload_hangs(mut self, prefix: &str) -> Self {
        self.behaviours.insert(prefix.to_string(), Behaviour::Hang);
        self
    }

    /// Output returned for probes whose name starts with `prefix`
    #[must_use]
    pub fn workload_output(mut self, prefix: &str, output: WorkloadOutput) -> Self {
        self.outputs.insert(prefix.to_string(), output);
        self
    }

    /// Creating any probe workload fails after the request was recorded
    #[must_use]
    pub fn fail_workload_creation(mut self) -> Self {
        self.fail_workload_creation = true;
        self
    }

    /// Reading any probe output never completes
    #[must_use]
    pub fn hang_workload_output(mut self) -> Self {
        self.hang_workload_output = true;
        self
    }

    /// Reading any probe output fails
    #[must_use]
    pub fn fail_workload_output(mut self) -> Self {
        self.fail_workload_output = true;
        self
    }

    /// Deleting any probe workload fails
    #[must_use]
    pub fn fail_workload_deletion(mut self) -> Self {
        self.fail_workload_deletion = true;
        self
    }

    /// Applying the manifest with this name fails
    #[must_use]
    pub fn fail_apply(mut self, manifest: &str) -> Self {
        self.failing_applies.insert(manifest.to_string());
        self
    }

    /// Deleting the object with this name fails
    #[must_use]
    pub fn fail_delete(mut self, name: &str) -> Self {
        self.failing_deletes.insert(name.to_string());
        self
    }

    /// Names of manifests applied successfully, in order
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    /// Apply attempts, including failed ones
    #[must_use]
    pub fn apply_calls(&self) -> usize {
        self.lock().apply_calls
    }

    /// Objects deleted successfully, in order
    #[must_use]
    pub fn deleted(&self) -> Vec<ResourceHandle> {
        self.lock().deleted.clone()
    }

    /// Status lookups for one resource key
    #[must_use]
    pub fn status_calls(&self, resource: &str) -> usize {
        self.lock().status_calls.get(resource).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_status_calls(&self) -> usize {
        self.lock().status_calls.values().sum()
    }

    /// Every probe workload started, in order
    #[must_use]
    pub fn created_workloads(&self) -> Vec<WorkloadSpec> {
        self.lock().created_workloads.clone()
    }

    /// Every probe deletion attempt, in order
    #[must_use]
    pub fn workload_deletions(&self) -> Vec<WorkloadHandle> {
        self.lock().workload_deletions.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn by_prefix<'a, T>(map: &'a HashMap<String, T>, name: &str) -> Option<&'a T> {
        map.iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, value)| value)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn apply(
        &self,
        namespace: &str,
        manifest: &Manifest,
    ) -> Result<Vec<ResourceHandle>, ClientError> {
        let mut state = self.lock();
        state.apply_calls += 1;

        if self.failing_applies.contains(&manifest.name) {
            return Err(ClientError::Api(format!(
                "admission webhook denied {}",
                manifest.name
            )));
        }

        let handles = manifest
            .documents
            .iter()
            .map(|doc| ResourceHandle {
                api_version: doc["apiVersion"].as_str().unwrap_or_default().to_string(),
                kind: doc["kind"].as_str().unwrap_or_default().to_string(),
                name: doc["metadata"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                namespace: Some(
                    doc["metadata"]["namespace"]
                        .as_str()
                        .unwrap_or(namespace)
                        .to_string(),
                ),
            })
            .collect();

        state.applied.push(manifest.name.clone());
        Ok(handles)
    }

    async fn status(&self, resource: &ResourceRef) -> Result<ResourceStatus, ClientError> {
        let key = resource.to_string();
        let mut state = self.lock();
        *state.status_calls.entry(key.clone()).or_default() += 1;

        if let Some(results) = state.scripted.get_mut(&key) {
            let next = if results.len() > 1 {
                results.pop_front()
            } else {
                results.front().cloned()
            };
            if let Some(result) = next {
                return result;
            }
        }

        match resource {
            ResourceRef::Pods { selector, .. } => {
                let (ready, total) = self.pods.get(selector).copied().unwrap_or((0, 0));
                Ok(ResourceStatus::Pods { ready, total })
            }
            ResourceRef::Service { name, .. } => self
                .services
                .get(name)
                .map(|&endpoints| ResourceStatus::Service { endpoints })
                .ok_or_else(|| ClientError::NotFound(format!("Service '{name}' not found"))),
            ResourceRef::Workload(handle) => {
                let phase = match Self::by_prefix(&self.behaviours, &handle.name) {
                    Some(Behaviour::Hang) => WorkloadPhase::Running,
                    Some(Behaviour::Exit(code)) => WorkloadPhase::Terminated { exit_code: *code },
                    None => WorkloadPhase::Terminated { exit_code: 0 },
                };
                Ok(ResourceStatus::Workload(phase))
            }
        }
    }

    async fn delete(&self, resource: &ResourceHandle) -> Result<(), ClientError> {
        if self.failing_deletes.contains(&resource.name) {
            return Err(ClientError::Api(format!("cannot delete {resource}")));
        }
        self.lock().deleted.push(resource.clone());
        Ok(())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ClientError> {
        self.lock().created_workloads.push(spec.clone());
        if self.fail_workload_creation {
            return Err(ClientError::Api(format!(
                "create pod {}: request timed out",
                spec.name
            )));
        }
        Ok(WorkloadHandle {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        })
    }

    async fn workload_output(
        &self,
        workload: &WorkloadHandle,
    ) -> Result<WorkloadOutput, ClientError> {
        if self.hang_workload_output {
            futures::future::pending::<()>().await;
        }
        if self.fail_workload_output {
            return Err(ClientError::Api(format!("cannot read logs of {workload}")));
        }
        Ok(Self::by_prefix(&self.outputs, &workload.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_workload(&self, workload: &WorkloadHandle) -> Result<(), ClientError> {
        self.lock().workload_deletions.push(workload.clone());
        if self.fail_workload_deletion {
            return Err(ClientError::Api(format!("cannot delete {workload}")));
        }
        Ok(())
    }
}

/// A single-object manifest named `<kind>-<name>.yaml`
#[must_use]
pub fn manifest(kind: &str, name: &str) -> Manifest {
    let api_version = match kind {
        "Deployment" | "DaemonSet" | "StatefulSet" => "apps/v1",
        "ClusterRole" | "ClusterRoleBinding" | "Role" | "RoleBinding" => {
            "rbac.authorization.k8s.io/v1"
        }
        _ => "v1",
    };

    Manifest {
        name: format!("{}-{name}.yaml", kind.to_lowercase()),
        documents: vec![json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": name },
        })],
    }
}
