//! The job handler used by the worker: turns a queued job description into
//! a graded result.
//!
//! For every job the handler stages the submission and framework archives
//! in a private scratch directory, optionally checks the submission's
//! digest, runs the grading image in the sandbox and passes the reduced
//! output on to a [`ResultSink`]. Any error is returned to the consumer,
//! which decides whether the delivery goes back on the queue.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::HandlerConfig;
use crate::errors::HandlerError;
use crate::job::{JobDescription, SubmissionResult};
use crate::queue::JobHandler;
use crate::sandbox::{ExitSignal, SandboxExecutor, SandboxRequest};

pub mod sink;

pub use sink::{HttpResultSink, LogResultSink, ResultSink};

pub const SECTION_BEGIN: &str = "--- BEGIN --- INFOMARK -- WORKER";
pub const SECTION_END: &str = "--- END --- INFOMARK -- WORKER";

/// Text stored for a submission whose grading image exited with a failure.
pub fn framework_failure_message(submission_id: i64) -> String {
    format!(
        "There has been an issue during testing your upload (The ID is {}). \
         The testing-framework has failed (not the server).",
        submission_id
    )
}

/// The part of the output the grading framework marked for the student.
///
/// Returns the text between the first begin marker and the end marker that
/// follows it, or the whole output when there is no begin marker.
pub fn extract_graded_section(output: &str) -> &str {
    match output.split_once(SECTION_BEGIN) {
        Some((_, rest)) => match rest.split_once(SECTION_END) {
            Some((section, _)) => section,
            None => rest,
        },
        None => output,
    }
}

pub struct SubmissionHandler {
    executor: Arc<SandboxExecutor>,
    sink: Arc<dyn ResultSink>,
    config: HandlerConfig,
    default_memory_limit: u64,
    client: Client,
}

impl SubmissionHandler {
    pub fn new(
        executor: Arc<SandboxExecutor>,
        sink: Arc<dyn ResultSink>,
        config: HandlerConfig,
        default_memory_limit: u64,
    ) -> Self {
        Self {
            executor,
            sink,
            config,
            default_memory_limit,
            client: Client::new(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Grade one job and hand the result to the sink.
    pub async fn process(&self, job: &JobDescription) -> Result<SubmissionResult, HandlerError> {
        self.sink.check(job)?;

        tokio::fs::create_dir_all(&self.config.workdir).await?;
        // removed with everything staged in it when this function returns
        let scratch = TempDir::new_in(&self.config.workdir)?;
        let prefix = Uuid::new_v4();

        let submission = self
            .stage(
                &job.submission_file,
                &scratch.path().join(format!("{}-submission.zip", prefix)),
                job.access_token.as_deref(),
            )
            .await?;
        let framework = self
            .stage(
                &job.framework_file,
                &scratch.path().join(format!("{}-framework.zip", prefix)),
                job.access_token.as_deref(),
            )
            .await?;

        if let Some(expected) = &job.sha_256 {
            verify_checksum(&submission, expected).await?;
        }

        let request = SandboxRequest {
            image: job.docker_image.clone(),
            submission,
            framework,
            memory_limit_bytes: job.memory_limit_bytes.unwrap_or(self.default_memory_limit),
        };

        log::info!(
            "testing submission {} with image {}",
            job.submission_id,
            job.docker_image
        );
        let started_at = Utc::now();
        let execution = self.executor.run(&request).await?;
        let finished_at = Utc::now();

        let log = match execution.outcome {
            ExitSignal::RuntimeError => {
                log::warn!(
                    "grading image for submission {} failed:\n{}",
                    job.submission_id,
                    execution.output
                );
                framework_failure_message(job.submission_id)
            }
            ExitSignal::Completed | ExitSignal::TimedOut => {
                extract_graded_section(&execution.output).to_string()
            }
        };

        let result = SubmissionResult {
            submission_id: job.submission_id,
            log,
            outcome: execution.outcome,
            started_at,
            finished_at,
        };
        self.sink.deliver(job, &result).await?;
        Ok(result)
    }

    /// Make `reference` available as a local file. URLs are downloaded to
    /// `target`; local paths are used where they are.
    async fn stage(
        &self,
        reference: &str,
        target: &Path,
        token: Option<&str>,
    ) -> Result<PathBuf, HandlerError> {
        let staging_error = |message: String| HandlerError::Staging {
            reference: reference.to_string(),
            message,
        };

        if !is_remote(reference) {
            // bind mounts need absolute paths
            return tokio::fs::canonicalize(reference)
                .await
                .map_err(|e| staging_error(e.to_string()));
        }

        let mut request = self.client.get(reference);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| staging_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(staging_error(format!("download returned status {}", response.status())));
        }

        let limit = self.config.max_archive_bytes;
        if response.content_length().is_some_and(|length| length > limit) {
            return Err(staging_error(format!("archive is larger than {} bytes", limit)));
        }

        let mut file = tokio::fs::File::create(target).await?;
        let mut body = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| staging_error(e.to_string()))?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(staging_error(format!("archive is larger than {} bytes", limit)));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        log::debug!("staged {} ({} bytes) at {}", reference, written, target.display());

        Ok(target.to_path_buf())
    }
}

#[async_trait]
impl JobHandler for SubmissionHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let job: JobDescription = serde_json::from_slice(body)?;

        if self.config.void {
            log::info!("void mode, dropping job for submission {}", job.submission_id);
            return Ok(());
        }

        let result = self.process(&job).await?;
        log::info!(
            "submission {} graded ({:?})",
            result.submission_id,
            result.outcome
        );
        Ok(())
    }
}

fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

async fn verify_checksum(path: &Path, expected: &str) -> Result<(), HandlerError> {
    let content = tokio::fs::read(path).await?;
    let actual = format!("{:x}", Sha256::digest(&content));

    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(HandlerError::Checksum {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
