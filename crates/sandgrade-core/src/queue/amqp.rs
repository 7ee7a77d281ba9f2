//! AMQP specifics shared by the consumer and the producer

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use lapin::options::{BasicAckOptions, BasicNackOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};

use super::Delivery;
use crate::config::{ExchangeKind, WorkerConfig};
use crate::errors::QueueError;

pub type DeliveryStream = BoxStream<'static, Result<AmqpDelivery, QueueError>>;

/// A delivery received over AMQP.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

impl From<lapin::message::Delivery> for AmqpDelivery {
    fn from(inner: lapin::message::Delivery) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(self) -> Result<(), QueueError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(QueueError::Ack)
    }

    async fn nack(self, requeue: bool) -> Result<(), QueueError> {
        self.inner
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(QueueError::Ack)
    }
}

pub(crate) fn into_delivery_stream(consumer: lapin::Consumer) -> DeliveryStream {
    consumer
        .map(|next| next.map(AmqpDelivery::from).map_err(QueueError::Delivery))
        .boxed()
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// Dial the broker and open a channel on the new connection.
pub(crate) async fn open_channel(config: &WorkerConfig) -> Result<(Connection, Channel), QueueError> {
    log::info!("dialing {}", config.redacted_address());
    let connection = Connection::connect(&config.broker_address, ConnectionProperties::default())
        .await
        .map_err(QueueError::Dial)?;

    log::info!("got Connection, getting Channel");
    let channel = connection
        .create_channel()
        .await
        .map_err(QueueError::Channel)?;

    Ok((connection, channel))
}

/// Declare the job exchange. Consumer and producer must declare it with the
/// same arguments or the broker rejects the second declaration.
pub(crate) async fn declare_exchange(channel: &Channel, config: &WorkerConfig) -> Result<(), QueueError> {
    log::info!(
        "got Channel, declaring {:?} Exchange ({})",
        config.exchange_kind.as_str(),
        config.exchange_name
    );
    channel
        .exchange_declare(
            &config.exchange_name,
            exchange_kind(config.exchange_kind),
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: false,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(QueueError::ExchangeDeclare)
}
