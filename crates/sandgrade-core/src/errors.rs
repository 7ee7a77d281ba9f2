//! Error types for every failure mode of the worker
//!
//! Errors are grouped by the subsystem that raises them so that the consumer
//! loop can make its single decision (ack, or nack with requeue) without
//! inspecting error text. Startup failures (`ConfigError`, the setup variants
//! of `QueueError`, `SandboxError::Connect`) are fatal to the process; the
//! rest are scoped to one job.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failure reported by a [`ContainerRuntime`](crate::sandbox::ContainerRuntime).
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("No such container: {0}")]
    NotFound(String),
    #[error("Container runtime error: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox request: {0}")]
    InvalidRequest(String),
    #[error("Failed to connect to container runtime: {0}")]
    Connect(#[source] RuntimeError),
    #[error("Failed to create container from image '{image}': {source}")]
    Create {
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Failed to start container {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Failed while waiting for container {id}: {source}")]
    Wait {
        id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Failed to collect output of container {id}: {source}")]
    Logs {
        id: String,
        #[source]
        source: RuntimeError,
    },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Dial: {0}")]
    Dial(#[source] lapin::Error),
    #[error("Channel: {0}")]
    Channel(#[source] lapin::Error),
    #[error("Exchange Declare: {0}")]
    ExchangeDeclare(#[source] lapin::Error),
    #[error("Queue Declare: {0}")]
    QueueDeclare(#[source] lapin::Error),
    #[error("Queue Bind: {0}")]
    QueueBind(#[source] lapin::Error),
    #[error("Queue Consume: {0}")]
    Consume(#[source] lapin::Error),
    #[error("Exchange Publish: {0}")]
    Publish(#[source] lapin::Error),
    #[error("Delivery stream failed: {0}")]
    Delivery(#[source] lapin::Error),
    #[error("Acknowledgement failed: {0}")]
    Ack(#[source] lapin::Error),
    #[error("Consumer cancel failed: {0}")]
    Cancel(#[source] lapin::Error),
    #[error("AMQP connection close error: {0}")]
    Close(#[source] lapin::Error),
    #[error("Failed to encode job description: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Consumer is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },
    #[error("Consumer loop terminated unexpectedly")]
    LoopAborted,
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Failed to decode job description: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Failed to stage archive '{reference}': {message}")]
    Staging { reference: String, message: String },
    #[error("Sha256 mismatch, actual {actual} vs. expected {expected} for file {path}")]
    Checksum {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("Sandbox run failed: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("Failed to deliver result for submission {submission_id}: {message}")]
    Sink { submission_id: i64, message: String },
    /// The job can never succeed, however often it is redelivered.
    #[error("Job for submission {submission_id} rejected: {reason}")]
    Rejected { submission_id: i64, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handler error: {0}")]
    Other(String),
}

impl HandlerError {
    /// Whether redelivering the job cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Rejected { .. })
    }
}
