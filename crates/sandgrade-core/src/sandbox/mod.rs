//! Sandboxed execution of untrusted grading workloads.
//!
//! A run takes a pre-pulled container image plus two read-only input
//! archives (the student's submission and the course's test framework),
//! executes the image's default command with networking disabled, one CPU
//! and a hard memory cap, and reduces whatever the workload printed to a
//! bounded [`ExecutionResult`]. Misbehaving student code (hanging, flooding
//! stdout, crashing) is reported through the result, never as an error;
//! errors are reserved for failures of the sandbox itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::RuntimeError;

pub mod docker;
pub mod executor;

pub use docker::DockerRuntime;
pub use executor::SandboxExecutor;

/// In-container location of the submission archive.
pub const SUBMISSION_MOUNT: &str = "/data/submission.zip";
/// In-container location of the test framework archive.
pub const FRAMEWORK_MOUNT: &str = "/data/unittest.zip";

/// Replaces the output of a workload that printed more than the limit.
pub const OUTPUT_TOO_LARGE_MESSAGE: &str = "Output too large (you're printing too much stuff)";

/// Feedback shown to the student when the workload exceeds its time budget.
pub fn timeout_message(timeout: Duration) -> String {
    format!("Execution took too long (Timeout: {:?})", timeout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitSignal {
    Completed,
    TimedOut,
    RuntimeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: String,
    pub outcome: ExitSignal,
}

impl ExecutionResult {
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            output: timeout_message(timeout),
            outcome: ExitSignal::TimedOut,
        }
    }

    /// Build the result of a workload that exited on its own. Output longer
    /// than `limit` bytes is replaced by a fixed notice.
    pub fn from_output(raw: Vec<u8>, limit: usize, status_code: i64) -> Self {
        let outcome = if status_code == 0 {
            ExitSignal::Completed
        } else {
            ExitSignal::RuntimeError
        };

        let output = if raw.len() > limit {
            OUTPUT_TOO_LARGE_MESSAGE.to_string()
        } else {
            match String::from_utf8(raw) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }
        };

        Self { output, outcome }
    }
}

/// One grading run.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub image: String,
    pub submission: PathBuf,
    pub framework: PathBuf,
    pub memory_limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
}

/// Everything a runtime needs to create one isolated container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub memory_limit_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub mounts: Vec<BindMount>,
}

/// The container operations the executor relies on.
///
/// Implementations must treat `remove` of an unknown container as success so
/// that cleanup can be repeated safely.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits and return its status code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Combined stdout/stderr. Reading stops as soon as more than
    /// `max_bytes` bytes have been collected.
    async fn logs(&self, id: &str, max_bytes: usize) -> Result<Vec<u8>, RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}
