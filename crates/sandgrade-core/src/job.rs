//! Messages exchanged between the submission service and the worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::ExitSignal;

/// A request to grade one submission, published as the JSON body of a
/// queue message.
///
/// `submission_file` and `framework_file` are either local paths visible to
/// the worker or `http(s)://` URLs to download with `access_token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub submission_id: i64,
    pub docker_image: String,
    pub submission_file: String,
    pub framework_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_endpoint_url: Option<String>,
    /// Expected hex digest of the submission archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha_256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl JobDescription {
    pub fn new(
        submission_id: i64,
        docker_image: impl Into<String>,
        submission_file: impl Into<String>,
        framework_file: impl Into<String>,
    ) -> Self {
        Self {
            submission_id,
            docker_image: docker_image.into(),
            submission_file: submission_file.into(),
            framework_file: framework_file.into(),
            memory_limit_bytes: None,
            access_token: None,
            result_endpoint_url: None,
            sha_256: None,
            enqueued_at: None,
        }
    }
}

/// Outcome of grading one submission, handed to a result sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submission_id: i64,
    pub log: String,
    pub outcome: ExitSignal,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
