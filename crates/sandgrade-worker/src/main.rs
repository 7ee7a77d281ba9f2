//! Background worker that grades student submissions in Docker sandboxes
//!
//! `sandgrade work` keeps one or more consumers attached to the submission
//! queue until it receives Ctrl+C or SIGTERM. `sandgrade produce` enqueues a
//! single job, which is mostly useful for smoke-testing a deployment.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use sandgrade_core::{
    config::ConfigLoader, shutdown_signal, DockerRuntime, HttpResultSink, JobDescription,
    JobHandler, LogResultSink, Producer, ResultSink, SandboxExecutor, Settings, SubmissionHandler,
    Worker,
};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Sandgrade - grade code submissions in isolated containers")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, global = true, default_value = "sandgrade.yaml", help = "Path to the YAML configuration file")]
    config: String,

    #[clap(long, short, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume jobs until interrupted
    Work {
        #[clap(long, short, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..), help = "Number of consumers to run")]
        number: u16,

        #[clap(long, help = "Write results to the log instead of posting them to the job's result endpoint")]
        log_results: bool,
    },
    /// Publish a single job
    Produce {
        #[clap(long)]
        submission_id: i64,

        #[clap(long, help = "Pre-pulled grading image")]
        image: String,

        #[clap(long, help = "Submission archive: local path or http(s) URL")]
        submission: String,

        #[clap(long, help = "Test framework archive: local path or http(s) URL")]
        framework: String,

        #[clap(long)]
        memory_limit_bytes: Option<u64>,

        #[clap(long)]
        result_endpoint: Option<String>,

        #[clap(long)]
        access_token: Option<String>,

        #[clap(long, help = "Expected sha256 of the submission archive")]
        sha256: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    log::info!("Loading configuration from: {}", cli.config);
    let settings = ConfigLoader::from_file(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    match cli.command {
        Commands::Work { number, log_results } => run_worker(settings, usize::from(number), log_results).await,
        Commands::Produce {
            submission_id,
            image,
            submission,
            framework,
            memory_limit_bytes,
            result_endpoint,
            access_token,
            sha256,
        } => {
            let job = JobDescription {
                memory_limit_bytes,
                result_endpoint_url: result_endpoint,
                access_token,
                sha_256: sha256,
                enqueued_at: Some(Utc::now()),
                ..JobDescription::new(submission_id, image, submission, framework)
            };
            produce(settings, job).await
        }
    }
}

async fn run_worker(settings: Settings, instances: usize, log_results: bool) -> Result<()> {
    let worker_config = Arc::new(settings.broker.worker_config());

    let runtime = DockerRuntime::connect(settings.sandbox.docker_host.as_deref())?;
    runtime.ping().await.context("Docker daemon is not reachable")?;
    let executor = Arc::new(SandboxExecutor::new(Arc::new(runtime), &settings.sandbox));

    let sink: Arc<dyn ResultSink> = if log_results {
        Arc::new(LogResultSink)
    } else {
        Arc::new(HttpResultSink::default())
    };
    let handler: Arc<dyn JobHandler> = Arc::new(SubmissionHandler::new(
        executor,
        sink,
        settings.handler.clone(),
        settings.sandbox.memory_limit_bytes,
    ));

    if settings.handler.void {
        log::warn!("Void mode is enabled, jobs are decoded and dropped without grading");
    }

    let worker = Worker::new(worker_config.clone(), handler, instances);
    let running = worker.start().await?;
    log::info!(
        "{} consumer(s) listening on queue '{}' (press Ctrl+C to stop)",
        running.len(),
        worker_config.queue_name
    );

    shutdown_signal().await;

    running.shutdown().await?;
    log::info!("Sandgrade worker shut down gracefully.");
    Ok(())
}

async fn produce(settings: Settings, job: JobDescription) -> Result<()> {
    let producer = Producer::new(Arc::new(settings.broker.worker_config()));
    producer.publish_job(&job).await?;
    println!("Published job for submission {}", job.submission_id);
    Ok(())
}
