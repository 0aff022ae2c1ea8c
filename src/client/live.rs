use super::pod::probe_pod;
use super::{
    ClientError, ClusterClient, Manifest, ResourceHandle, ResourceRef, ResourceStatus,
    WorkloadHandle, WorkloadOutput, WorkloadPhase, WorkloadSpec,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams,
};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::Client;
use tracing::{debug, info};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "proxy-e2e";

/// [`ClusterClient`] backed by a real Kubernetes API server
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Wrap an existing kube client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the default kubeconfig or in-cluster configuration
    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        Ok(Self { client })
    }

    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), ClientError> {
        let gvk = parse_gvk(api_version, kind);

        discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| match e {
                kube::Error::Discovery(_) => {
                    ClientError::Invalid(format!("unknown kind {kind} in {api_version}"))
                }
                kube::Error::Api(ref ae) if ae.code == 404 => {
                    ClientError::Invalid(format!("unknown API group version {api_version}"))
                }
                other => ClientError::Api(other.to_string()),
            })
    }

    fn dynamic_api(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn apply(
        &self,
        namespace: &str,
        manifest: &Manifest,
    ) -> Result<Vec<ResourceHandle>, ClientError> {
        let mut handles = Vec::with_capacity(manifest.documents.len());

        for document in &manifest.documents {
            let mut obj: DynamicObject = serde_json::from_value(document.clone())
                .map_err(|e| ClientError::Invalid(format!("{}: {e}", manifest.name)))?;

            let api_version = document["apiVersion"].as_str().unwrap_or_default();
            let kind = document["kind"].as_str().unwrap_or_default();
            let name = obj.metadata.name.clone().ok_or_else(|| {
                ClientError::Invalid(format!("{}: object must have metadata.name", manifest.name))
            })?;

            let (resource, caps) = self.resolve(api_version, kind).await?;

            let target_namespace = match caps.scope {
                Scope::Cluster => {
                    obj.metadata.namespace = None;
                    None
                }
                Scope::Namespaced => {
                    let ns = obj
                        .metadata
                        .namespace
                        .clone()
                        .unwrap_or_else(|| namespace.to_string());
                    obj.metadata.namespace = Some(ns.clone());
                    Some(ns)
                }
            };

            let api = self.dynamic_api(&resource, target_namespace.as_deref());
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await
            .map_err(|e| classify(&e, kind, &name))?;

            info!(
                manifest = %manifest.name,
                kind = %kind,
                name = %name,
                namespace = ?target_namespace,
                "Applied object"
            );

            handles.push(ResourceHandle {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                name,
                namespace: target_namespace,
            });
        }

        Ok(handles)
    }

    async fn status(&self, resource: &ResourceRef) -> Result<ResourceStatus, ClientError> {
        match resource {
            ResourceRef::Pods {
                namespace,
                selector,
            } => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let list = pods
                    .list(&ListParams::default().labels(selector))
                    .await
                    .map_err(|e| classify(&e, "Pod", selector))?;

                let live: Vec<&Pod> = list
                    .items
                    .iter()
                    .filter(|p| p.metadata.deletion_timestamp.is_none())
                    .collect();
                let ready = live.iter().filter(|p| is_pod_ready(p)).count();

                Ok(ResourceStatus::Pods {
                    ready,
                    total: live.len(),
                })
            }
            ResourceRef::Service { namespace, name } => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                services
                    .get(name)
                    .await
                    .map_err(|e| classify(&e, "Service", name))?;

                let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
                let ready = endpoints
                    .get_opt(name)
                    .await
                    .map_err(|e| classify(&e, "Endpoints", name))?
                    .map_or(0, |ep| ready_endpoints(&ep));

                Ok(ResourceStatus::Service { endpoints: ready })
            }
            ResourceRef::Workload(handle) => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &handle.namespace);
                let pod = pods
                    .get(&handle.name)
                    .await
                    .map_err(|e| classify(&e, "Pod", &handle.name))?;

                Ok(ResourceStatus::Workload(workload_phase(&pod)))
            }
        }
    }

    async fn delete(&self, resource: &ResourceHandle) -> Result<(), ClientError> {
        let (api_resource, _) = self.resolve(&resource.api_version, &resource.kind).await?;
        let api = self.dynamic_api(&api_resource, resource.namespace.as_deref());

        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(resource = %resource, "Deleted object");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(resource = %resource, "Object already gone");
                Ok(())
            }
            Err(e) => Err(classify(&e, &resource.kind, &resource.name)),
        }
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ClientError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &spec.namespace);

        pods.create(&PostParams::default(), &probe_pod(spec))
            .await
            .map_err(|e| classify(&e, "Pod", &spec.name))?;

        info!(
            namespace = %spec.namespace,
            pod = %spec.name,
            image = %spec.image,
            "Created probe pod"
        );

        Ok(WorkloadHandle {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        })
    }

    async fn workload_output(
        &self,
        workload: &WorkloadHandle,
    ) -> Result<WorkloadOutput, ClientError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);

        let logs = match pods.logs(&workload.name, &LogParams::default()).await {
            Ok(logs) => logs,
            // The container never started, so there is nothing to read
            Err(kube::Error::Api(ae)) if ae.code == 400 => String::new(),
            Err(e) => return Err(classify(&e, "Pod", &workload.name)),
        };

        let message = pods
            .get(&workload.name)
            .await
            .map_err(|e| classify(&e, "Pod", &workload.name))?
            .status
            .and_then(|s| s.container_statuses)
            .and_then(|cs| cs.into_iter().next())
            .and_then(|c| c.state)
            .and_then(|s| s.terminated)
            .and_then(|t| t.message)
            .unwrap_or_default();

        Ok(WorkloadOutput {
            stdout: logs.into_bytes(),
            stderr: message.into_bytes(),
        })
    }

    async fn delete_workload(&self, workload: &WorkloadHandle) -> Result<(), ClientError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);

        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };

        match pods.delete(&workload.name, &params).await {
            Ok(_) => {
                debug!(workload = %workload, "Deleted probe pod");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify(&e, "Pod", &workload.name)),
        }
    }
}

fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn ready_endpoints(endpoints: &Endpoints) -> usize {
    endpoints
        .subsets
        .iter()
        .flatten()
        .map(|subset| subset.addresses.as_ref().map_or(0, Vec::len))
        .sum()
}

fn workload_phase(pod: &Pod) -> WorkloadPhase {
    let status = pod.status.as_ref();

    let terminated = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref());

    if let Some(terminated) = terminated {
        return WorkloadPhase::Terminated {
            exit_code: terminated.exit_code,
        };
    }

    match status.and_then(|s| s.phase.as_deref()) {
        Some("Running") => WorkloadPhase::Running,
        Some("Succeeded") => WorkloadPhase::Terminated { exit_code: 0 },
        // Failed before any container reported an exit code (e.g. evicted)
        Some("Failed") => WorkloadPhase::Terminated { exit_code: 1 },
        _ => WorkloadPhase::Pending,
    }
}

/// Map a kube error onto [`ClientError`] with a readable message
fn classify(err: &kube::Error, kind: &str, name: &str) -> ClientError {
    let message = improve_error_message(err, kind, name);

    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(message),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => ClientError::Invalid(message),
        _ => ClientError::Api(message),
    }
}

/// Improve a kube error message with human-readable context
fn improve_error_message(err: &kube::Error, resource_kind: &str, resource_name: &str) -> String {
    let raw = err.to_string();

    if raw.contains("NotFound") || raw.contains("404") {
        return format!("{resource_kind} '{resource_name}' not found");
    }

    if raw.contains("AlreadyExists") || raw.contains("409") {
        return format!("{resource_kind} '{resource_name}' already exists");
    }

    if raw.contains("Forbidden") || raw.contains("403") {
        return format!("{resource_kind} '{resource_name}': permission denied (check RBAC)");
    }

    if raw.contains("connection refused") || raw.contains("ECONNREFUSED") {
        return format!("{resource_kind} '{resource_name}': cannot connect to Kubernetes API");
    }

    if raw.contains("timeout") || raw.contains("deadline exceeded") {
        return format!("{resource_kind} '{resource_name}': operation timed out");
    }

    format!("{resource_kind} '{resource_name}': {raw}")
}
