//! Destinations for graded results

use async_trait::async_trait;
use reqwest::Client;

use crate::errors::HandlerError;
use crate::job::{JobDescription, SubmissionResult};

/// Receives the result of every graded submission.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Reject jobs whose result could never be delivered, before any work
    /// is done for them.
    fn check(&self, _job: &JobDescription) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn deliver(&self, job: &JobDescription, result: &SubmissionResult) -> Result<(), HandlerError>;
}

/// Posts results as JSON to the endpoint named in the job.
pub struct HttpResultSink {
    client: Client,
}

impl HttpResultSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpResultSink {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

fn endpoint(job: &JobDescription) -> Result<&str, HandlerError> {
    let rejected = |reason: &str| HandlerError::Rejected {
        submission_id: job.submission_id,
        reason: reason.to_string(),
    };
    let endpoint = job
        .result_endpoint_url
        .as_deref()
        .ok_or_else(|| rejected("job has no result endpoint"))?;
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(rejected("result endpoint is not an http(s) URL"));
    }
    Ok(endpoint)
}

#[async_trait]
impl ResultSink for HttpResultSink {
    fn check(&self, job: &JobDescription) -> Result<(), HandlerError> {
        endpoint(job).map(|_| ())
    }

    async fn deliver(&self, job: &JobDescription, result: &SubmissionResult) -> Result<(), HandlerError> {
        let sink_error = |message: String| HandlerError::Sink {
            submission_id: result.submission_id,
            message,
        };

        let endpoint = endpoint(job)?;

        let mut request = self.client.post(endpoint).json(result);
        if let Some(token) = &job.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| sink_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(sink_error(format!("endpoint returned status {}", response.status())));
        }

        log::debug!("result for submission {} posted to {}", result.submission_id, endpoint);
        Ok(())
    }
}

/// Writes results to the log only. Used when no result service is deployed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn deliver(&self, _job: &JobDescription, result: &SubmissionResult) -> Result<(), HandlerError> {
        log::info!(
            "submission {} finished ({:?}, {}ms):\n{}",
            result.submission_id,
            result.outcome,
            (result.finished_at - result.started_at).num_milliseconds(),
            result.log
        );
        Ok(())
    }
}
