//! Given-phase steps
//!
//! A [`Setup`] mutates cluster state. It signals completion, not readiness:
//! waiting for what it created to come up is the job of the When phase.

use crate::client::{ClientError, Manifest, ManifestError};
use crate::context::ScenarioContext;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Error type for setup steps
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to apply {manifest}: {source}")]
    Apply {
        manifest: String,
        #[source]
        source: ClientError,
    },

    #[error("{0}")]
    Failed(String),
}

/// A Given-phase step
#[async_trait]
pub trait Setup: Send + Sync {
    /// Short label used in reports
    fn describe(&self) -> String;

    async fn apply(&self, ctx: &mut ScenarioContext) -> Result<(), SetupError>;
}

/// Where a manifest comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestSource {
    /// A file, resolved against the suite's manifest directory when relative
    Path(PathBuf),
    /// An already parsed manifest
    Inline(Manifest),
}

impl ManifestSource {
    fn label(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Inline(manifest) => manifest.name.clone(),
        }
    }
}

/// Setup that applies a list of manifests, in order
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedManifests {
    sources: Vec<ManifestSource>,
}

/// Apply manifest files, in order
///
/// ```ignore
/// created_manifests([
///     "basics/clusterRole.yaml",
///     "basics/clusterRoleBinding.yaml",
///     "basics/deployment.yaml",
/// ])
/// ```
pub fn created_manifests<I, P>(paths: I) -> CreatedManifests
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    CreatedManifests {
        sources: paths
            .into_iter()
            .map(|p| ManifestSource::Path(p.into()))
            .collect(),
    }
}

/// Apply already parsed manifests, in order
pub fn created_inline<I>(manifests: I) -> CreatedManifests
where
    I: IntoIterator<Item = Manifest>,
{
    CreatedManifests {
        sources: manifests.into_iter().map(ManifestSource::Inline).collect(),
    }
}

impl CreatedManifests {
    #[must_use]
    pub fn sources(&self) -> &[ManifestSource] {
        &self.sources
    }
}

#[async_trait]
impl Setup for CreatedManifests {
    fn describe(&self) -> String {
        let names: Vec<String> = self.sources.iter().map(ManifestSource::label).collect();
        format!("created manifests [{}]", names.join(", "))
    }

    async fn apply(&self, ctx: &mut ScenarioContext) -> Result<(), SetupError> {
        apply_manifests(ctx, &self.sources).await
    }
}

/// Apply manifests one after another, stopping at the first failure
///
/// Every applied object is tracked in the context for end-of-scenario
/// cleanup, including the objects applied before a failure.
pub async fn apply_manifests(
    ctx: &mut ScenarioContext,
    sources: &[ManifestSource],
) -> Result<(), SetupError> {
    for source in sources {
        let manifest = match source {
            ManifestSource::Path(path) => {
                let path = if path.is_relative() {
                    ctx.config().manifest_dir.join(path)
                } else {
                    path.clone()
                };
                Manifest::load(&path).await?
            }
            ManifestSource::Inline(manifest) => manifest.clone(),
        };

        let handles = ctx
            .client()
            .apply(ctx.namespace(), &manifest)
            .await
            .map_err(|source| SetupError::Apply {
                manifest: manifest.name.clone(),
                source,
            })?;

        info!(
            scenario = %ctx.scenario(),
            manifest = %manifest.name,
            objects = handles.len(),
            "Applied manifest"
        );

        ctx.track(handles);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;
    use crate::testing::{manifest, FakeCluster};
    use std::sync::Arc;

    fn context(fake: &Arc<FakeCluster>, config: SuiteConfig) -> ScenarioContext {
        ScenarioContext::new("setup", fake.clone(), Arc::new(config))
    }

    #[tokio::test]
    async fn test_applies_in_order_and_tracks() {
        let fake = Arc::new(FakeCluster::new());
        let mut ctx = context(&fake, SuiteConfig::new());

        let setup = created_inline([
            manifest("ServiceAccount", "kube-rbac-proxy"),
            manifest("ClusterRole", "kube-rbac-proxy"),
            manifest("Deployment", "kube-rbac-proxy"),
        ]);
        setup.apply(&mut ctx).await.unwrap();

        assert_eq!(
            fake.applied(),
            vec![
                "serviceaccount-kube-rbac-proxy.yaml",
                "clusterrole-kube-rbac-proxy.yaml",
                "deployment-kube-rbac-proxy.yaml",
            ]
        );
        assert_eq!(ctx.created().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_manifests() {
        let fake = Arc::new(FakeCluster::new().fail_apply("clusterrolebinding-client.yaml"));
        let mut ctx = context(&fake, SuiteConfig::new());

        let setup = created_inline([
            manifest("ClusterRole", "client"),
            manifest("ClusterRoleBinding", "client"),
            manifest("Deployment", "kube-rbac-proxy"),
            manifest("Service", "kube-rbac-proxy"),
            manifest("ServiceAccount", "kube-rbac-proxy"),
        ]);
        let err = setup.apply(&mut ctx).await.unwrap_err();

        assert!(matches!(err, SetupError::Apply { .. }));
        assert_eq!(fake.apply_calls(), 2);
        assert_eq!(fake.applied(), vec!["clusterrole-client.yaml"]);
        // what was applied before the failure still gets cleaned up
        assert_eq!(ctx.created().len(), 1);
    }

    #[tokio::test]
    async fn test_loads_relative_paths_from_manifest_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("basics")).unwrap();
        std::fs::write(
            dir.path().join("basics/service.yaml"),
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: kube-rbac-proxy\n",
        )
        .unwrap();

        let fake = Arc::new(FakeCluster::new());
        let mut ctx = context(&fake, SuiteConfig::new().manifest_dir(dir.path()));

        created_manifests(["basics/service.yaml"])
            .apply(&mut ctx)
            .await
            .unwrap();

        assert_eq!(fake.apply_calls(), 1);
        assert_eq!(ctx.created()[0].kind, "Service");
    }

    #[tokio::test]
    async fn test_missing_file_fails_before_apply() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCluster::new());
        let mut ctx = context(&fake, SuiteConfig::new().manifest_dir(dir.path()));

        let err = created_manifests(["basics/missing.yaml"])
            .apply(&mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, SetupError::Manifest(ManifestError::Read { .. })));
        assert_eq!(fake.apply_calls(), 0);
    }

    #[test]
    fn test_describe_lists_manifests() {
        let setup = created_manifests(["basics/clusterRole.yaml", "basics/service.yaml"]);
        assert_eq!(
            setup.describe(),
            "created manifests [basics/clusterRole.yaml, basics/service.yaml]"
        );
    }
}
