//! Cluster client seam
//!
//! Everything the scenario engine needs from the cluster goes through the
//! [`ClusterClient`] trait: applying manifests, reading resource status,
//! running probe workloads and deleting what was created. [`KubeClient`]
//! talks to a real cluster; [`crate::testing::FakeCluster`] is an in-memory
//! stand-in for unit tests.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

mod live;
mod pod;

pub use live::KubeClient;
pub use pod::{probe_pod, CERT_MOUNT_DIR, TOKEN_FILE, TOKEN_MOUNT_DIR};

/// Errors from cluster operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to create Kubernetes client: {0}")]
    Connect(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input such as a bad label selector or an unknown kind
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Kubernetes API error: {0}")]
    Api(String),
}

impl ClientError {
    /// Whether a poller should keep retrying after this error
    ///
    /// Only malformed input is treated as permanent. Everything else,
    /// including connection failures, is cluster state that may still change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

/// Errors from loading manifest files
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in manifest {name}: {reason}")]
    InvalidYaml { name: String, reason: String },

    #[error("invalid object in manifest {name}: {reason}")]
    InvalidObject { name: String, reason: String },
}

/// A manifest file: one or more Kubernetes objects
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// Where the manifest came from, used in logs and errors
    pub name: String,
    /// Parsed objects, in file order
    pub documents: Vec<serde_json::Value>,
}

impl Manifest {
    /// Parse a (possibly multi-document) YAML manifest
    ///
    /// Empty documents are skipped. Every remaining document must be a
    /// mapping with `apiVersion`, `kind` and `metadata.name`.
    pub fn from_yaml(name: impl Into<String>, yaml: &str) -> Result<Self, ManifestError> {
        let name = name.into();
        let mut documents = Vec::new();

        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = serde_json::Value::deserialize(document).map_err(|e| {
                ManifestError::InvalidYaml {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;

            if value.is_null() {
                continue;
            }

            validate_object(&name, &value)?;
            documents.push(value);
        }

        if documents.is_empty() {
            return Err(ManifestError::InvalidObject {
                name,
                reason: "manifest contains no objects".to_string(),
            });
        }

        Ok(Self { name, documents })
    }

    /// Read and parse a manifest file
    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestError::Read {
                path: path.display().to_string(),
                source,
            })?;

        Self::from_yaml(path.display().to_string(), &yaml)
    }
}

fn validate_object(name: &str, value: &serde_json::Value) -> Result<(), ManifestError> {
    let invalid = |reason: &str| ManifestError::InvalidObject {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if !value.is_object() {
        return Err(invalid("document is not a mapping"));
    }
    if value["apiVersion"].as_str().is_none_or(str::is_empty) {
        return Err(invalid("missing apiVersion"));
    }
    if value["kind"].as_str().is_none_or(str::is_empty) {
        return Err(invalid("missing kind"));
    }
    if value["metadata"]["name"].as_str().is_none_or(str::is_empty) {
        return Err(invalid("missing metadata.name"));
    }

    Ok(())
}

/// Handle to an object created by applying a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} in {}", self.kind.to_lowercase(), self.name, ns),
            None => write!(f, "{}/{}", self.kind.to_lowercase(), self.name),
        }
    }
}

/// Something whose status can be observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    /// All pods matching a label selector
    Pods { namespace: String, selector: String },
    /// A service and its endpoints
    Service { namespace: String, name: String },
    /// A probe workload
    Workload(WorkloadHandle),
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pods {
                namespace,
                selector,
            } => write!(f, "pods[{selector}] in {namespace}"),
            Self::Service { namespace, name } => write!(f, "service/{name} in {namespace}"),
            Self::Workload(handle) => write!(f, "{handle}"),
        }
    }
}

/// Observed status of a [`ResourceRef`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Pods { ready: usize, total: usize },
    Service { endpoints: usize },
    Workload(WorkloadPhase),
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pods { ready, total } => write!(f, "{ready}/{total} pods ready"),
            Self::Service { endpoints } => write!(f, "{endpoints} ready endpoints"),
            Self::Workload(phase) => write!(f, "{phase}"),
        }
    }
}

/// Run state of a probe workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Terminated { exit_code: i32 },
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Terminated { exit_code } => write!(f, "terminated with exit code {exit_code}"),
        }
    }
}

/// Credential material mounted into a probe workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// The automounted service-account token
    ServiceAccount,
    /// A projected service-account token bound to an audience
    AudienceToken { audience: String },
    /// A client certificate/key pair from a secret
    ClientCertificate { secret: String },
}

/// Everything needed to start a probe workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub credentials: Credentials,
    pub service_account: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Handle to a running or finished probe workload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadHandle {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pod/{} in {}", self.name, self.namespace)
    }
}

/// Output captured from a probe workload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Operations the scenario engine needs from a cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Apply every object in a manifest, returning handles to what was applied
    ///
    /// Objects without a namespace land in `namespace` when they are
    /// namespace-scoped.
    async fn apply(
        &self,
        namespace: &str,
        manifest: &Manifest,
    ) -> Result<Vec<ResourceHandle>, ClientError>;

    /// Observe the current status of a resource
    ///
    /// Returns `ClientError::NotFound` when the resource does not exist.
    async fn status(&self, resource: &ResourceRef) -> Result<ResourceStatus, ClientError>;

    /// Delete an object previously returned by [`apply`](Self::apply)
    async fn delete(&self, resource: &ResourceHandle) -> Result<(), ClientError>;

    /// Start a probe workload
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ClientError>;

    /// Read what a workload wrote
    async fn workload_output(&self, workload: &WorkloadHandle)
        -> Result<WorkloadOutput, ClientError>;

    /// Delete a probe workload
    async fn delete_workload(&self, workload: &WorkloadHandle) -> Result<(), ClientError>;
}
