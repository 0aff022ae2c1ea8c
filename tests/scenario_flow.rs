//! Scenario runs against the in-memory cluster

use proxy_e2e::prelude::*;
use proxy_e2e::client::{ClientError, ResourceStatus, WorkloadOutput};
use proxy_e2e::testing::FakeCluster;
use proxy_e2e::{Phase, PollError, StepError, SuiteConfig};
use std::sync::Arc;
use std::time::Duration;

const PROXY_MANIFESTS: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: kube-rbac-proxy
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: kube-rbac-proxy
---
apiVersion: v1
kind: Service
metadata:
  name: kube-rbac-proxy
";

fn suite(fake: &Arc<FakeCluster>, manifest_dir: &std::path::Path) -> Suite {
    let config = SuiteConfig::new()
        .manifest_dir(manifest_dir)
        .poll_interval(Duration::from_millis(5))
        .condition_timeout(Duration::from_millis(150))
        .probe_interval(Duration::from_millis(5))
        .probe_timeout(Duration::from_millis(150));
    Suite::new(fake.clone(), config)
}

fn manifest_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("basics")).unwrap();
    std::fs::write(dir.path().join("basics/proxy.yaml"), PROXY_MANIFESTS).unwrap();
    std::fs::write(
        dir.path().join("basics/clusterRoleBinding-client.yaml"),
        "apiVersion: rbac.authorization.k8s.io/v1\n\
         kind: ClusterRoleBinding\n\
         metadata:\n  name: kube-rbac-proxy-client\n",
    )
    .unwrap();
    dir
}

#[tokio::test]
async fn test_with_rbac_scenario_passes_and_cleans_up() {
    let dir = manifest_dir();
    let fake = Arc::new(
        FakeCluster::new()
            .script_status(
                "pods[app=kube-rbac-proxy] in default",
                vec![
                    Ok(ResourceStatus::Pods { ready: 0, total: 1 }),
                    Ok(ResourceStatus::Pods { ready: 1, total: 1 }),
                ],
            )
            .script_status(
                "service/kube-rbac-proxy in default",
                vec![
                    Err(ClientError::NotFound("Service 'kube-rbac-proxy' not found".to_string())),
                    Ok(ResourceStatus::Service { endpoints: 1 }),
                ],
            )
            .workload_exit("kube-rbac-proxy-client", 0)
            .workload_output(
                "kube-rbac-proxy-client",
                WorkloadOutput {
                    stdout: b"# HELP go_goroutines".to_vec(),
                    stderr: Vec::new(),
                },
            ),
    );

    suite(&fake, dir.path())
        .scenario(
            "WithRBAC",
            "As a client with the correct RBAC rules,
             I succeed with my request",
        )
        .given(created_manifests([
            "basics/proxy.yaml",
            "basics/clusterRoleBinding-client.yaml",
        ]))
        .when(pods_are_ready(1, "app=kube-rbac-proxy"))
        .when(service_is_ready("kube-rbac-proxy"))
        .then(run_succeeds("kube-rbac-proxy-client", shell("curl --fail https://svc")))
        .run()
        .await
        .unwrap();

    let deleted: Vec<String> = fake
        .deleted()
        .into_iter()
        .map(|h| format!("{}/{}", h.kind, h.name))
        .collect();
    assert_eq!(
        deleted,
        vec![
            "ClusterRoleBinding/kube-rbac-proxy-client",
            "Service/kube-rbac-proxy",
            "Deployment/kube-rbac-proxy",
            "ServiceAccount/kube-rbac-proxy",
        ]
    );
    assert_eq!(fake.workload_deletions().len(), 1);
}

#[tokio::test]
async fn test_no_rbac_scenario_expects_failure() {
    let dir = manifest_dir();
    let fake = Arc::new(
        FakeCluster::new()
            .pods("app=kube-rbac-proxy", 1, 1)
            .service("kube-rbac-proxy", 1)
            .workload_exit("kube-rbac-proxy-client", 22),
    );

    suite(&fake, dir.path())
        .scenario("NoRBAC", "As a client without any RBAC rule access, I fail")
        .given(created_manifests(["basics/proxy.yaml"]))
        .when(pods_are_ready(1, "app=kube-rbac-proxy"))
        .then(run_fails("kube-rbac-proxy-client", shell("curl --fail https://svc")))
        .run()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pods_never_ready_fails_in_when_without_probing() {
    let dir = manifest_dir();
    let fake = Arc::new(
        FakeCluster::new()
            .pods("app=kube-rbac-proxy", 0, 1)
            .workload_exit("kube-rbac-proxy-client", 0),
    );

    let err = suite(&fake, dir.path())
        .scenario("NeverReady", "pods never become ready")
        .given(created_manifests(["basics/proxy.yaml"]))
        .when(pods_are_ready(1, "app=kube-rbac-proxy"))
        .then(run_succeeds("kube-rbac-proxy-client", shell("true")))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.phase, Phase::When);
    match &err.source {
        StepError::Condition(PollError::Timeout(wait)) => {
            assert_eq!(wait.last_state, "0/1 pods ready (1 matching)");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fake.created_workloads().is_empty());
    // cleanup still ran
    assert_eq!(fake.deleted().len(), 3);
}

#[tokio::test]
async fn test_missing_manifest_fails_in_given() {
    let dir = manifest_dir();
    let fake = Arc::new(FakeCluster::new());

    let err = suite(&fake, dir.path())
        .scenario("Missing", "a manifest file does not exist")
        .given(created_manifests(["basics/proxy.yaml", "basics/missing.yaml"]))
        .when(pods_are_ready(1, "app=kube-rbac-proxy"))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.phase, Phase::Given);
    assert!(err.to_string().contains("missing.yaml"));
    assert_eq!(fake.total_status_calls(), 0);
    // the first manifest was applied and is removed again
    assert_eq!(fake.deleted().len(), 3);
}

#[tokio::test]
async fn test_run_all_reports_every_scenario() {
    let dir = manifest_dir();
    let fake = Arc::new(
        FakeCluster::new()
            .pods("app=kube-rbac-proxy", 1, 1)
            .service("kube-rbac-proxy", 1)
            .workload_exit("allowed", 0)
            .workload_exit("denied", 22),
    );
    let suite = suite(&fake, dir.path());

    let report = suite
        .run_all([
            suite
                .scenario("Denied", "unauthorized client")
                .then(run_succeeds("denied", shell("curl --fail https://svc"))),
            suite
                .scenario("Allowed", "authorized client")
                .when(service_is_ready("kube-rbac-proxy"))
                .then(run_succeeds("allowed", shell("curl --fail https://svc"))),
        ])
        .await;

    assert_eq!(report.passed_count(), 1);
    let failure = report.failures().next().unwrap();
    assert_eq!(failure.name, "Denied");
    assert!(failure.diagnostic().unwrap().contains("exit code 22"));
}
