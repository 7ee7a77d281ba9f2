//! Core library for the sandgrade submission test-execution worker.
//!
//! A worker receives grading jobs from a message broker, runs each student
//! submission against a course's test framework inside a locked-down
//! container, and reports a bounded log back to the submission service.
//!
//! # Architecture Overview
//!
//! - **Sandbox**: runs one container per job with no network, one CPU, a
//!   memory cap and a wall-clock budget, and always removes it afterwards
//! - **Queue**: AMQP consumer with manual acknowledgement, and a stateless
//!   producer for enqueuing jobs
//! - **Handler**: stages archives, runs the sandbox and delivers results
//! - **Configuration**: YAML settings with environment overrides
//! - **Worker**: starts and stops several consumers sharing one handler

pub mod config;
pub mod errors;
pub mod handler;
pub mod job;
pub mod queue;
pub mod sandbox;
pub mod worker;

pub use config::*;
pub use errors::{ConfigError, HandlerError, QueueError, RuntimeError, SandboxError};
pub use handler::{HttpResultSink, LogResultSink, ResultSink, SubmissionHandler};
pub use job::{JobDescription, SubmissionResult};
pub use queue::{handler_fn, Consumer, ConsumerState, Delivery, JobHandler, Producer};
pub use sandbox::{DockerRuntime, ExecutionResult, ExitSignal, SandboxExecutor, SandboxRequest};
pub use worker::{shutdown_signal, RunningWorker, Worker};

#[cfg(test)]
pub mod test_utils;
