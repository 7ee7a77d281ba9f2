//! Long-lived queue subscription driving a sequential handle loop

use futures_util::stream::{Stream, StreamExt};
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::amqp::{self, DeliveryStream};
use super::{Delivery, JobHandler};
use crate::config::WorkerConfig;
use crate::errors::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Connected,
    Consuming,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Created => "created",
            ConsumerState::Connected => "connected",
            ConsumerState::Consuming => "consuming",
            ConsumerState::ShuttingDown => "shutting down",
            ConsumerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    /// A delivery stream has been handed out but not yet driven.
    Pending,
    Running,
    Done,
}

struct Session {
    connection: Connection,
    channel: Channel,
}

struct Inner {
    state: ConsumerState,
    session: Option<Session>,
}

/// Consumes job deliveries from one queue, one at a time.
///
/// Typical use: `setup` to obtain the delivery stream, spawn `handle_loop`
/// with it, and later call `shutdown` to stop gracefully. `shutdown` waits
/// for the delivery being handled at that moment to be settled.
pub struct Consumer {
    config: Arc<WorkerConfig>,
    handler: Arc<dyn JobHandler>,
    inner: Mutex<Inner>,
    loop_state: watch::Sender<LoopState>,
}

impl Consumer {
    pub fn new(config: Arc<WorkerConfig>, handler: Arc<dyn JobHandler>) -> Self {
        let (loop_state, _) = watch::channel(LoopState::Idle);
        Self {
            config,
            handler,
            inner: Mutex::new(Inner {
                state: ConsumerState::Created,
                session: None,
            }),
            loop_state,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock only means another thread panicked mid-transition
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, expected: ConsumerState, next: ConsumerState) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.state != expected {
            return Err(QueueError::InvalidState {
                expected: expected.to_string(),
                actual: inner.state.to_string(),
            });
        }
        inner.state = next;
        Ok(())
    }

    /// Connect, declare the topology and start consuming with manual acks.
    pub async fn setup(&self) -> Result<DeliveryStream, QueueError> {
        let state = self.state();
        if state != ConsumerState::Created {
            return Err(QueueError::InvalidState {
                expected: ConsumerState::Created.to_string(),
                actual: state.to_string(),
            });
        }

        let config = &self.config;
        log::info!(
            "[{}] setup AMQP connection (exchange={}, type={}, queue={}, key={})",
            config.identity,
            config.exchange_name,
            config.exchange_kind.as_str(),
            config.queue_name,
            config.routing_key
        );

        let (connection, channel) = amqp::open_channel(config).await?;
        amqp::declare_exchange(&channel, config).await?;

        log::info!("declared Exchange, declaring Queue");
        let queue = channel
            .queue_declare(
                &config.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::QueueDeclare)?;
        log::info!(
            "declared Queue ({} messages, {} consumers), binding to Exchange",
            queue.message_count(),
            queue.consumer_count()
        );

        channel
            .queue_bind(
                &config.queue_name,
                &config.routing_key,
                &config.exchange_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::QueueBind)?;

        {
            let mut inner = self.lock();
            inner.state = ConsumerState::Connected;
            inner.session = Some(Session {
                connection,
                channel: channel.clone(),
            });
        }

        log::info!(
            "Queue bound to Exchange, starting Consume (Consumer tag '{}')",
            config.identity
        );
        let consumer = match channel
            .basic_consume(
                &config.queue_name,
                &config.identity,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                let session = {
                    let mut inner = self.lock();
                    inner.state = ConsumerState::Created;
                    inner.session.take()
                };
                if let Some(session) = session {
                    let _ = session.connection.close(0, "consume failed").await;
                }
                return Err(QueueError::Consume(e));
            }
        };

        self.begin_consuming(ConsumerState::Connected)?;
        Ok(amqp::into_delivery_stream(consumer))
    }

    /// From here on `shutdown` waits for `handle_loop` to finish, even if the
    /// loop has not been polled yet.
    fn begin_consuming(&self, from: ConsumerState) -> Result<(), QueueError> {
        self.transition(from, ConsumerState::Consuming)?;
        self.loop_state.send_replace(LoopState::Pending);
        Ok(())
    }

    /// Handle deliveries in receipt order until the stream ends.
    ///
    /// Each delivery is settled before the next one is read: acked when the
    /// handler succeeds, nacked when it fails (requeued unless the redelivery
    /// policy says to drop it). An error from the stream itself ends the loop.
    pub async fn handle_loop<S, D>(&self, deliveries: S)
    where
        S: Stream<Item = Result<D, QueueError>> + Send,
        D: Delivery,
    {
        self.loop_state.send_replace(LoopState::Running);
        let mut deliveries = std::pin::pin!(deliveries);

        while let Some(next) = deliveries.next().await {
            match next {
                Ok(delivery) => self.process(delivery).await,
                Err(e) => {
                    log::error!("[{}] delivery stream failed: {}", self.config.identity, e);
                    break;
                }
            }
        }

        log::info!("[{}] handle: deliveries channel closed", self.config.identity);
        self.loop_state.send_replace(LoopState::Done);
    }

    async fn process<D: Delivery>(&self, delivery: D) {
        let tag = &self.config.identity;
        log::info!(
            "[{}] got delivery ({} bytes{})",
            tag,
            delivery.body().len(),
            if delivery.redelivered() { ", redelivered" } else { "" }
        );

        let settled = match self.handler.handle(delivery.body()).await {
            Ok(()) => delivery.ack().await,
            Err(e) => {
                let requeue =
                    !e.is_permanent() && self.config.redelivery.should_requeue(delivery.redelivered());
                log::warn!(
                    "[{}] handler failed ({}), {}",
                    tag,
                    e,
                    if requeue { "requeueing delivery" } else { "dropping delivery" }
                );
                delivery.nack(requeue).await
            }
        };

        if let Err(e) = settled {
            log::error!("[{}] failed to settle delivery: {}", tag, e);
        }
    }

    /// Stop consuming, wait for the handle loop, then close the connection.
    ///
    /// The delivery being handled when this is called is still settled on
    /// the open channel. Only a consuming consumer can be shut down; any
    /// other state returns `QueueError::InvalidState` straight away.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.transition(ConsumerState::Consuming, ConsumerState::ShuttingDown)?;
        let session = self.lock().session.take();

        let (cancelled, closed) = match session {
            Some(session) => self.stop_session(session).await,
            None => (Ok(()), self.wait_for_loop().await),
        };

        self.lock().state = ConsumerState::Closed;

        cancelled?;
        closed?;
        log::info!("[{}] AMQP shutdown OK", self.config.identity);
        Ok(())
    }

    async fn stop_session(&self, session: Session) -> (Result<(), QueueError>, Result<(), QueueError>) {
        // cancelling ends the delivery stream, which ends handle_loop
        let cancelled = session
            .channel
            .basic_cancel(&self.config.identity, BasicCancelOptions::default())
            .await
            .map_err(QueueError::Cancel);

        let closed = match &cancelled {
            Ok(()) => {
                let waited = self.wait_for_loop().await;
                close_connection(&session.connection).await.and(waited)
            }
            Err(e) => {
                // without a cancel only closing the connection stops the stream
                log::warn!(
                    "[{}] consumer cancel failed ({}), closing connection",
                    self.config.identity,
                    e
                );
                let closed = close_connection(&session.connection).await;
                closed.and(self.wait_for_loop().await)
            }
        };
        (cancelled, closed)
    }

    async fn wait_for_loop(&self) -> Result<(), QueueError> {
        let mut state = self.loop_state.subscribe();
        state
            .wait_for(|s| matches!(s, LoopState::Idle | LoopState::Done))
            .await
            .map(|_| ())
            .map_err(|_| QueueError::LoopAborted)
    }
}

async fn close_connection(connection: &Connection) -> Result<(), QueueError> {
    connection
        .close(200, "consumer shutdown")
        .await
        .map_err(QueueError::Close)
}
