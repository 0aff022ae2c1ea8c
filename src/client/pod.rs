//! Pod manifests for probe workloads

use super::{Credentials, WorkloadSpec};
use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, ProjectedVolumeSource, SecretVolumeSource,
    ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Directory holding the audience-bound token
pub const TOKEN_MOUNT_DIR: &str = "/var/run/secrets/tokens";
/// File name of the audience-bound token inside [`TOKEN_MOUNT_DIR`]
pub const TOKEN_FILE: &str = "requestedtoken";
/// Directory holding `tls.crt` and `tls.key` for client certificate probes
pub const CERT_MOUNT_DIR: &str = "/certs";

const TOKEN_VOLUME: &str = "requested-token";
const CERT_VOLUME: &str = "client-certificates";
const TOKEN_EXPIRATION_SECONDS: i64 = 3600;

/// Build the run-to-completion pod for a probe workload
#[must_use]
pub fn probe_pod(spec: &WorkloadSpec) -> Pod {
    let (volumes, mounts) = match &spec.credentials {
        Credentials::ServiceAccount => (Vec::new(), Vec::new()),
        Credentials::AudienceToken { audience } => (
            vec![Volume {
                name: TOKEN_VOLUME.to_string(),
                projected: Some(ProjectedVolumeSource {
                    sources: Some(vec![VolumeProjection {
                        service_account_token: Some(ServiceAccountTokenProjection {
                            audience: Some(audience.clone()),
                            expiration_seconds: Some(TOKEN_EXPIRATION_SECONDS),
                            path: TOKEN_FILE.to_string(),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            vec![VolumeMount {
                name: TOKEN_VOLUME.to_string(),
                mount_path: TOKEN_MOUNT_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            }],
        ),
        Credentials::ClientCertificate { secret } => (
            vec![Volume {
                name: CERT_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            vec![VolumeMount {
                name: CERT_VOLUME.to_string(),
                mount_path: CERT_MOUNT_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            }],
        ),
    };

    let container = Container {
        name: "probe".to_string(),
        image: Some(spec.image.clone()),
        command: Some(spec.command.clone()),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            service_account_name: spec.service_account.clone(),
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(credentials: Credentials) -> WorkloadSpec {
        WorkloadSpec {
            name: "kube-rbac-proxy-client-1a2b3c4d".to_string(),
            namespace: "default".to_string(),
            image: "quay.io/brancz/krp-curl:v0.0.2".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
            credentials,
            service_account: None,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_probe_pod_defaults() {
        let pod = probe_pod(&spec(Credentials::ServiceAccount));
        let pod_spec = pod.spec.unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("kube-rbac-proxy-client-1a2b3c4d"));
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert!(pod_spec.volumes.is_none());
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(
            pod_spec.containers[0].command.as_deref(),
            Some(&["/bin/sh".to_string(), "-c".to_string(), "true".to_string()][..])
        );
        assert!(pod_spec.containers[0].volume_mounts.is_none());
    }

    #[test]
    fn test_probe_pod_audience_token() {
        let pod = probe_pod(&spec(Credentials::AudienceToken {
            audience: "kube-rbac-proxy".to_string(),
        }));
        let pod_spec = pod.spec.unwrap();

        let volumes = pod_spec.volumes.unwrap();
        let projection = volumes[0].projected.as_ref().unwrap().sources.as_ref().unwrap()[0]
            .service_account_token
            .as_ref()
            .unwrap();
        assert_eq!(projection.audience.as_deref(), Some("kube-rbac-proxy"));
        assert_eq!(projection.path, TOKEN_FILE);

        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, TOKEN_MOUNT_DIR);
    }

    #[test]
    fn test_probe_pod_client_certificate() {
        let pod = probe_pod(&spec(Credentials::ClientCertificate {
            secret: "kube-rbac-proxy-client-certificates".to_string(),
        }));
        let pod_spec = pod.spec.unwrap();

        let volumes = pod_spec.volumes.unwrap();
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("kube-rbac-proxy-client-certificates")
        );
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, CERT_MOUNT_DIR);
    }
}
