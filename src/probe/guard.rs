//! Scoped deletion of probe workloads

use crate::client::{ClusterClient, WorkloadHandle};
use std::sync::Arc;
use tracing::{debug, warn};

/// Deletes a probe workload when released or dropped, exactly once
///
/// [`release`](Self::release) deletes inline. A guard dropped while still
/// armed (panic, cancelled future) spawns the deletion on the current tokio
/// runtime instead. That task is detached and may not run if the runtime
/// shuts down first, so the drop path is logged at `warn`.
pub struct WorkloadGuard {
    client: Arc<dyn ClusterClient>,
    handle: Option<WorkloadHandle>,
}

impl WorkloadGuard {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, handle: WorkloadHandle) -> Self {
        Self {
            client,
            handle: Some(handle),
        }
    }

    /// The guarded workload, `None` once released
    #[must_use]
    pub fn handle(&self) -> Option<&WorkloadHandle> {
        self.handle.as_ref()
    }

    /// Delete the workload now
    ///
    /// Failures are logged and swallowed.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            delete_logged(self.client.as_ref(), &handle).await;
        }
    }
}

impl Drop for WorkloadGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    workload = %handle,
                    "Probe workload guard dropped while armed, deleting in the background"
                );
                let client = self.client.clone();
                runtime.spawn(async move {
                    delete_logged(client.as_ref(), &handle).await;
                });
            }
            Err(_) => {
                warn!(
                    workload = %handle,
                    "No runtime available, probe workload left behind"
                );
            }
        }
    }
}

impl std::fmt::Debug for WorkloadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadGuard")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

async fn delete_logged(client: &dyn ClusterClient, handle: &WorkloadHandle) {
    match client.delete_workload(handle).await {
        Ok(()) => debug!(workload = %handle, "Deleted probe workload"),
        Err(e) => warn!(
            workload = %handle,
            error = %e,
            "Failed to delete probe workload"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use std::time::Duration;

    fn handle(name: &str) -> WorkloadHandle {
        WorkloadHandle {
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_release_deletes_once() {
        let fake = Arc::new(FakeCluster::new());
        let guard = WorkloadGuard::new(fake.clone(), handle("probe-1"));

        guard.release().await;

        assert_eq!(fake.workload_deletions(), vec![handle("probe-1")]);
    }

    #[tokio::test]
    async fn test_drop_schedules_deletion() {
        let fake = Arc::new(FakeCluster::new());
        {
            let _guard = WorkloadGuard::new(fake.clone(), handle("probe-2"));
        }

        for _ in 0..50 {
            if !fake.workload_deletions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(fake.workload_deletions(), vec![handle("probe-2")]);
    }

    #[tokio::test]
    async fn test_release_swallows_delete_failure() {
        let fake = Arc::new(FakeCluster::new().fail_workload_deletion());
        let guard = WorkloadGuard::new(fake.clone(), handle("probe-3"));

        guard.release().await;

        assert_eq!(fake.workload_deletions(), vec![handle("probe-3")]);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_armed_drop_is_logged() {
        let fake = Arc::new(FakeCluster::new());
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            drop(WorkloadGuard::new(fake.clone(), handle("probe-4")));
        });

        let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"));
        assert!(logs.contains("pod/probe-4"));
    }
}
