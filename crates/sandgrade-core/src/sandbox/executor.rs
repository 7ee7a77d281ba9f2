//! Drives one container through create, start, wait and collect, under a
//! wall-clock budget, and always tears the container down afterwards.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    BindMount, ContainerRuntime, ContainerSpec, ExecutionResult, SandboxRequest,
    FRAMEWORK_MOUNT, SUBMISSION_MOUNT,
};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;

/// Runs grading workloads. Holds no per-run state, so one executor can be
/// shared by any number of concurrent callers.
pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
    output_limit: usize,
    cpu_period: i64,
    cpu_quota: i64,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &SandboxConfig) -> Self {
        Self {
            runtime,
            timeout: config.timeout,
            output_limit: config.output_limit_bytes,
            cpu_period: config.cpu_period,
            cpu_quota: config.cpu_quota,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the image against the two archives.
    ///
    /// Timeouts and oversized output are `Ok` results carrying a notice for
    /// the student. `Err` means the sandbox itself could not do its job.
    pub async fn run(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        let spec = self.container_spec(request)?;
        let image = spec.image.clone();

        let id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|source| SandboxError::Create { image, source })?;
        log::debug!("Created container {} ({})", spec.name, id);

        let guard = ContainerGuard::new(self.runtime.clone(), id);
        let outcome = self.drive(guard.id()).await;
        guard.release().await;

        outcome
    }

    async fn drive(&self, id: &str) -> Result<ExecutionResult, SandboxError> {
        self.runtime
            .start(id)
            .await
            .map_err(|source| SandboxError::Start {
                id: id.to_string(),
                source,
            })?;

        let status_code = match tokio::time::timeout(self.timeout, self.runtime.wait(id)).await {
            Ok(waited) => waited.map_err(|source| SandboxError::Wait {
                id: id.to_string(),
                source,
            })?,
            Err(_) => {
                log::warn!("Execution timed out for container {} after {:?}", id, self.timeout);
                return Ok(ExecutionResult::timed_out(self.timeout));
            }
        };

        let raw = self
            .runtime
            .logs(id, self.output_limit)
            .await
            .map_err(|source| SandboxError::Logs {
                id: id.to_string(),
                source,
            })?;
        log::debug!(
            "Container {} exited with status {} after printing {} bytes",
            id,
            status_code,
            raw.len()
        );

        Ok(ExecutionResult::from_output(raw, self.output_limit, status_code))
    }

    fn container_spec(&self, request: &SandboxRequest) -> Result<ContainerSpec, SandboxError> {
        if request.memory_limit_bytes == 0 {
            return Err(SandboxError::InvalidRequest(
                "memory limit must be greater than 0".to_string(),
            ));
        }
        let memory_limit_bytes = i64::try_from(request.memory_limit_bytes).map_err(|_| {
            SandboxError::InvalidRequest(format!(
                "memory limit {} exceeds the supported range",
                request.memory_limit_bytes
            ))
        })?;
        if request.image.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("image name is empty".to_string()));
        }

        Ok(ContainerSpec {
            name: format!("sandgrade-{}", Uuid::new_v4()),
            image: request.image.clone(),
            memory_limit_bytes,
            cpu_period: self.cpu_period,
            cpu_quota: self.cpu_quota,
            mounts: vec![
                BindMount {
                    source: request.submission.clone(),
                    target: SUBMISSION_MOUNT.to_string(),
                },
                BindMount {
                    source: request.framework.clone(),
                    target: FRAMEWORK_MOUNT.to_string(),
                },
            ],
        })
    }
}

/// Owns a created container until it has been killed and removed.
///
/// `release` is the normal path. If the owning future is dropped first (for
/// example the caller's task is aborted), `Drop` hands the same teardown to
/// the current Tokio runtime.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            teardown(self.runtime.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    teardown(runtime.as_ref(), &id).await;
                });
            }
            Err(_) => log::error!("Container {} leaked: no runtime left to remove it", id),
        }
    }
}

async fn teardown(runtime: &dyn ContainerRuntime, id: &str) {
    // the workload has usually exited already, so a failed kill is expected
    if let Err(e) = runtime.kill(id).await {
        log::debug!("Kill of container {} skipped: {}", id, e);
    }
    if let Err(e) = runtime.remove(id).await {
        log::warn!("Failed to remove container {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RuntimeError;
    use crate::sandbox::{ExitSignal, OUTPUT_TOO_LARGE_MESSAGE};
    use crate::test_utils::{ScriptedRuntime, WaitBehaviour};
    use std::path::PathBuf;

    fn config(timeout: Duration) -> SandboxConfig {
        SandboxConfig {
            timeout,
            ..SandboxConfig::default()
        }
    }

    fn request() -> SandboxRequest {
        SandboxRequest {
            image: "grader:1".to_string(),
            submission: PathBuf::from("/work/abc-submission.zip"),
            framework: PathBuf::from("/work/abc-framework.zip"),
            memory_limit_bytes: 200 * 1024 * 1024,
        }
    }

    fn executor(runtime: &Arc<ScriptedRuntime>, timeout: Duration) -> SandboxExecutor {
        SandboxExecutor::new(runtime.clone(), &config(timeout))
    }

    #[tokio::test]
    async fn test_run_returns_output_verbatim() {
        let runtime = Arc::new(ScriptedRuntime::printing("OK"));
        let result = executor(&runtime, Duration::from_secs(5))
            .run(&request())
            .await
            .unwrap();

        assert_eq!(result.output, "OK");
        assert_eq!(result.outcome, ExitSignal::Completed);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_run_applies_resource_limits() {
        let runtime = Arc::new(ScriptedRuntime::printing("OK"));
        executor(&runtime, Duration::from_secs(5))
            .run(&request())
            .await
            .unwrap();

        let specs = runtime.specs();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert!(spec.name.starts_with("sandgrade-"));
        assert_eq!(spec.image, "grader:1");
        assert_eq!(spec.memory_limit_bytes, 200 * 1024 * 1024);
        assert_eq!(spec.cpu_quota, spec.cpu_period);
        assert_eq!(spec.mounts[0].target, SUBMISSION_MOUNT);
        assert_eq!(spec.mounts[0].source, PathBuf::from("/work/abc-submission.zip"));
        assert_eq!(spec.mounts[1].target, FRAMEWORK_MOUNT);
    }

    #[tokio::test]
    async fn test_each_run_gets_a_fresh_container() {
        let runtime = Arc::new(ScriptedRuntime::printing("OK"));
        let executor = executor(&runtime, Duration::from_secs(5));
        executor.run(&request()).await.unwrap();
        executor.run(&request()).await.unwrap();

        let specs = runtime.specs();
        assert_eq!(specs.len(), 2);
        assert_ne!(specs[0].name, specs[1].name);
    }

    #[tokio::test]
    async fn test_oversized_output_is_replaced() {
        let runtime = Arc::new(ScriptedRuntime::printing(vec![b'x'; 40_000]));
        let result = executor(&runtime, Duration::from_secs(5))
            .run(&request())
            .await
            .unwrap();

        assert_eq!(result.output, OUTPUT_TOO_LARGE_MESSAGE);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_result_not_an_error() {
        let runtime = Arc::new(ScriptedRuntime::hanging());
        let started = tokio::time::Instant::now();
        let result = executor(&runtime, Duration::from_secs(2))
            .run(&request())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.output.starts_with("Execution took too long"));
        assert_eq!(result.outcome, ExitSignal::TimedOut);
        assert_eq!(runtime.live_containers(), 0);

        let calls = runtime.calls();
        let kill = calls.iter().position(|c| c.starts_with("kill:")).unwrap();
        let remove = calls.iter().position(|c| c.starts_with("remove:")).unwrap();
        assert!(kill < remove);
        assert!(!calls.iter().any(|c| c.starts_with("logs:")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workload_finishing_inside_budget() {
        let runtime = Arc::new(
            ScriptedRuntime::printing("done")
                .with_wait(WaitBehaviour::ExitAfter(Duration::from_secs(1), 0)),
        );
        let result = executor(&runtime, Duration::from_secs(2))
            .run(&request())
            .await
            .unwrap();

        assert_eq!(result.output, "done");
        assert_eq!(result.outcome, ExitSignal::Completed);
    }

    #[tokio::test]
    async fn test_missing_image_is_an_error_without_cleanup() {
        let runtime = Arc::new(ScriptedRuntime::missing_image());
        let result = executor(&runtime, Duration::from_secs(5)).run(&request()).await;

        assert!(matches!(
            result,
            Err(SandboxError::Create { ref image, source: RuntimeError::Other(_) }) if image == "grader:1"
        ));
        let calls = runtime.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("create:"));
    }

    #[tokio::test]
    async fn test_start_failure_still_removes_container() {
        let runtime = Arc::new(ScriptedRuntime::printing("").with_start_error("cannot mount"));
        let result = executor(&runtime, Duration::from_secs(5)).run(&request()).await;

        assert!(matches!(result, Err(SandboxError::Start { .. })));
        assert_eq!(runtime.live_containers(), 0);
        assert!(runtime.calls().iter().any(|c| c.starts_with("remove:")));
    }

    #[tokio::test]
    async fn test_zero_memory_is_rejected_before_create() {
        let runtime = Arc::new(ScriptedRuntime::printing("OK"));
        let mut request = request();
        request.memory_limit_bytes = 0;
        let result = executor(&runtime, Duration::from_secs(5)).run(&request).await;

        assert!(matches!(result, Err(SandboxError::InvalidRequest(_))));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_teardown_is_harmless() {
        let runtime = Arc::new(ScriptedRuntime::printing("OK"));
        executor(&runtime, Duration::from_secs(5))
            .run(&request())
            .await
            .unwrap();
        let id = runtime.specs()[0].name.clone();

        teardown(runtime.as_ref(), &id).await;
        teardown(runtime.as_ref(), &id).await;
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_dropped_run_still_removes_container() {
        let runtime = Arc::new(ScriptedRuntime::hanging());
        let executor = Arc::new(executor(&runtime, Duration::from_secs(3600)));

        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.run(&request()).await }
        });
        while runtime.live_containers() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        for _ in 0..100 {
            if runtime.live_containers() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.live_containers(), 0);
    }
}
