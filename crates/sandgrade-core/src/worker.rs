//! Process-level orchestration of several consumers sharing one handler

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::errors::QueueError;
use crate::queue::{Consumer, JobHandler};

/// Starts `instances` consumers on the same queue. Each consumer owns its own
/// broker connection; all of them share the configuration and the handler.
pub struct Worker {
    config: Arc<WorkerConfig>,
    handler: Arc<dyn JobHandler>,
    instances: usize,
}

impl Worker {
    pub fn new(config: Arc<WorkerConfig>, handler: Arc<dyn JobHandler>, instances: usize) -> Self {
        Self {
            config,
            handler,
            instances,
        }
    }

    /// Set up every consumer and spawn its handle loop.
    ///
    /// If one consumer cannot be set up, the ones already running are shut
    /// down again and the setup error is returned.
    pub async fn start(&self) -> Result<RunningWorker, QueueError> {
        let mut running = RunningWorker {
            consumers: Vec::with_capacity(self.instances),
        };

        for index in 0..self.instances {
            let consumer = Arc::new(Consumer::new(self.config.clone(), self.handler.clone()));
            let deliveries = match consumer.setup().await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    log::error!("consumer {} failed to start: {}", index, e);
                    if let Err(shutdown_error) = running.shutdown().await {
                        log::warn!("shutdown after failed start: {}", shutdown_error);
                    }
                    return Err(e);
                }
            };

            let looping = consumer.clone();
            let task = tokio::spawn(async move { looping.handle_loop(deliveries).await });
            log::info!("consumer {} of {} running", index + 1, self.instances);
            running.consumers.push((consumer, task));
        }

        Ok(running)
    }
}

/// Handle to the consumers started by [`Worker::start`].
pub struct RunningWorker {
    consumers: Vec<(Arc<Consumer>, JoinHandle<()>)>,
}

impl RunningWorker {
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Shut every consumer down, waiting for in-flight jobs to settle.
    /// All consumers are attempted; the first error is returned.
    pub async fn shutdown(self) -> Result<(), QueueError> {
        let mut first_error = None;

        for (index, (consumer, task)) in self.consumers.into_iter().enumerate() {
            log::info!("shutting down consumer {}", index + 1);
            if let Err(e) = consumer.shutdown().await {
                log::error!("consumer {} shutdown failed: {}", index + 1, e);
                first_error.get_or_insert(e);
            }
            if let Err(e) = task.await {
                log::error!("consumer {} loop task failed: {}", index + 1, e);
                first_error.get_or_insert(QueueError::LoopAborted);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Completes on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
