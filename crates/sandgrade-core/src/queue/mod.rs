//! Message-queue plumbing between submission ingestion and the graders.
//!
//! The producer side publishes a serialized job description; the consumer
//! side keeps a subscription open and feeds one delivery at a time to a
//! [`JobHandler`], acknowledging only after the handler has returned. The
//! handler never sees the broker, and the broker never sees what the job
//! means.

use async_trait::async_trait;
use std::future::Future;

use crate::errors::{HandlerError, QueueError};

pub mod amqp;
pub mod consumer;
pub mod producer;

pub use amqp::{AmqpDelivery, DeliveryStream};
pub use consumer::{Consumer, ConsumerState};
pub use producer::Producer;

/// One message received from the broker together with the right to settle it.
///
/// `ack` and `nack` take the delivery by value, so a delivery can be settled
/// exactly once.
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    /// Whether the broker has handed this message out before.
    fn redelivered(&self) -> bool;

    async fn ack(self) -> Result<(), QueueError>;

    async fn nack(self, requeue: bool) -> Result<(), QueueError>;
}

/// Work to perform for every delivered job body.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        (self.0)(body.to_vec()).await
    }
}
