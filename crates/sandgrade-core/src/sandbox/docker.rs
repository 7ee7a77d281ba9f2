// src/sandbox/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, KillContainerOptionsBuilder,
    LogsOptions as BollardLogsOptionsQuery, RemoveContainerOptionsBuilder,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;

use super::{ContainerRuntime, ContainerSpec};
use crate::errors::{RuntimeError, SandboxError};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon. `None` uses the local defaults
    /// (`DOCKER_HOST` or the platform socket).
    pub fn connect(docker_host: Option<&str>) -> Result<Self, SandboxError> {
        let docker = match docker_host {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host.trim_start_matches("unix://"),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            Some(host) => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| SandboxError::Connect(RuntimeError::Bollard(e)))?;

        Ok(Self { docker })
    }

    /// Fail fast at startup when the daemon is unreachable.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Connect(RuntimeError::Bollard(e)))
    }

    fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
        let mounts = spec
            .mounts
            .iter()
            .map(|mount| Mount {
                target: Some(mount.target.clone()),
                source: Some(mount.source.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            })
            .collect();

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            // tty merges stdout and stderr into one stream in emission order
            tty: Some(true),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_limit_bytes),
                // equal to memory: no swap on top of the limit
                memory_swap: Some(spec.memory_limit_bytes),
                cpu_period: Some(spec.cpu_period),
                cpu_quota: Some(spec.cpu_quota),
                network_mode: Some("none".to_string()),
                mounts: Some(mounts),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .docker
            .create_container(Some(options), Self::container_body(spec))
            .await?;
        for warning in &response.warnings {
            log::warn!("Docker warning for container {}: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut wait_stream = self
            .docker
            .wait_container(id, None::<BollardWaitContainerOptionsQuery>);

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::Bollard(e)),
            None => Err(RuntimeError::Other(format!(
                "wait stream for container {} ended unexpectedly",
                id
            ))),
        }
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<Vec<u8>, RuntimeError> {
        let mut output_stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut collected = Vec::new();
        while let Some(log_result) = output_stream.next().await {
            let message = match log_result? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => message,
            };
            collected.extend_from_slice(&message);
            if collected.len() > max_bytes {
                break;
            }
        }

        Ok(collected)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(RuntimeError::Bollard(e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Bollard(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{BindMount, FRAMEWORK_MOUNT, SUBMISSION_MOUNT};
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandgrade-test".to_string(),
            image: "grader:1".to_string(),
            memory_limit_bytes: 64 * 1024 * 1024,
            cpu_period: 100_000,
            cpu_quota: 100_000,
            mounts: vec![
                BindMount {
                    source: PathBuf::from("/work/a-submission.zip"),
                    target: SUBMISSION_MOUNT.to_string(),
                },
                BindMount {
                    source: PathBuf::from("/work/a-framework.zip"),
                    target: FRAMEWORK_MOUNT.to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_container_body_is_isolated() {
        let body = DockerRuntime::container_body(&spec());

        assert_eq!(body.image.as_deref(), Some("grader:1"));
        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(body.tty, Some(true));
        assert!(body.cmd.is_none());

        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(64 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.cpu_quota, host.cpu_period);
        assert_eq!(host.network_mode.as_deref(), Some("none"));

        let mounts = host.mounts.unwrap();
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().all(|m| m.read_only == Some(true)));
        assert!(mounts.iter().all(|m| m.typ == Some(MountTypeEnum::BIND)));
        assert_eq!(mounts[0].target.as_deref(), Some(SUBMISSION_MOUNT));
        assert_eq!(mounts[0].source.as_deref(), Some("/work/a-submission.zip"));
        assert_eq!(mounts[1].target.as_deref(), Some(FRAMEWORK_MOUNT));
    }

    #[test]
    fn test_not_found_detection() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "is not running".to_string(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&conflict));
    }

    #[tokio::test]
    async fn test_docker_runtime_connection() {
        // Only meaningful where a Docker daemon is reachable
        if let Ok(runtime) = DockerRuntime::connect(None) {
            if runtime.ping().await.is_err() {
                println!("Docker not available, skipping ping assertion");
            }
        }
    }
}
