//! One-shot job publication

use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use std::sync::Arc;

use super::amqp;
use crate::config::WorkerConfig;
use crate::errors::QueueError;
use crate::job::JobDescription;

/// AMQP delivery mode 1: the broker may keep the message in memory only.
const TRANSIENT_DELIVERY: u8 = 1;

/// Publishes job bodies to the configured exchange.
///
/// Every call opens and closes its own connection, so a `Producer` holds no
/// broker state and can be shared freely.
#[derive(Debug, Clone)]
pub struct Producer {
    config: Arc<WorkerConfig>,
}

impl Producer {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self { config }
    }

    pub async fn publish(&self, body: &[u8]) -> Result<(), QueueError> {
        let config = &self.config;
        let (connection, channel) = amqp::open_channel(config).await?;

        let published = async {
            amqp::declare_exchange(&channel, config).await?;

            log::info!(
                "declared Exchange, publishing {}B body to '{}' with key '{}'",
                body.len(),
                config.exchange_name,
                config.routing_key
            );
            let confirm = channel
                .basic_publish(
                    &config.exchange_name,
                    &config.routing_key,
                    BasicPublishOptions::default(),
                    body,
                    BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_delivery_mode(TRANSIENT_DELIVERY),
                )
                .await
                .map_err(QueueError::Publish)?;
            confirm.await.map_err(QueueError::Publish)?;
            Ok::<(), QueueError>(())
        }
        .await;

        let closed = connection
            .close(200, "publish done")
            .await
            .map_err(QueueError::Close);

        published?;
        closed
    }

    /// Serialise `job` as JSON and publish it.
    pub async fn publish_job(&self, job: &JobDescription) -> Result<(), QueueError> {
        let body = serde_json::to_vec(job)?;
        log::debug!("publishing job for submission {}", job.submission_id);
        self.publish(&body).await
    }
}
