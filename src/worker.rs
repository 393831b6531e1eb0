//! A single consumer on the pool's shared connection.

use crate::broker::{BrokerChannel, BrokerConnection, CloseSignal, Delivery, DeliveryStream};
use crate::config::Config;
use crate::error::{BrokerError, WorkerError};
use crate::handler::{ErrorHandler, Handler, HandlerContext, HandlerError};
use crate::logging::Logger;
use crate::metrics::WorkerMetrics;
use crate::rejector::Rejector;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    /// Channel open and consumer registered.
    Connected,
    Running,
    /// Shutting down after a shutdown request.
    Closing,
    /// Stopped by an error; see the error returned from `run`.
    Fatal,
    Closed,
}

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub(crate) struct WorkerParts {
    pub(crate) config: Arc<Config>,
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) error_handler: Option<Arc<dyn ErrorHandler>>,
    pub(crate) rejector: Arc<dyn Rejector>,
    pub(crate) metrics: WorkerMetrics,
}

/// Consumes the pool's queue on a channel of its own, one delivery at a time.
pub struct Worker {
    name: String,
    parts: WorkerParts,
    logger: Logger,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub(crate) fn new(name: impl Into<String>, parts: WorkerParts) -> Self {
        let name = name.into();
        let (state, _) = watch::channel(WorkerState::Created);
        Self {
            logger: Logger::new(name.clone()),
            name,
            parts,
            channel: Mutex::new(None),
            state,
        }
    }

    /// Also the consumer tag.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Opens the channel and consumes until `shutdown` is cancelled or a
    /// fatal error occurs. The channel is closed either way.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let result = self.consume(&shutdown).await;
        if let Err(e) = &result {
            if shutdown.is_cancelled() {
                self.logger.warn(format_args!("worker stopped during shutdown: {}", e));
            } else {
                self.logger.error(format_args!("fatal error in worker: {}", e));
            }
            self.set_state(WorkerState::Fatal);
        }
        if let Err(e) = self.close().await {
            self.logger.warn(format_args!("failed to close channel: {}", e));
        }
        // the pool may have closed the channel first
        self.set_state(WorkerState::Closed);
        result
    }

    async fn connect(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), WorkerError> {
        let channel = self
            .parts
            .connection
            .create_channel()
            .await
            .map_err(WorkerError::Connection)?;
        *self.channel.lock().await = Some(channel.clone());

        channel.qos(1).await.map_err(WorkerError::Connection)?;
        let config = &self.parts.config;
        let deliveries = channel
            .consume(&config.queue_name, &self.name, &config.consume_options)
            .await
            .map_err(WorkerError::Consume)?;

        self.set_state(WorkerState::Connected);
        Ok((channel, deliveries))
    }

    async fn consume(&self, shutdown: &CancellationToken) -> Result<(), WorkerError> {
        // taken before consuming so a close racing the first delivery is seen
        let mut connection_closed = self.parts.connection.close_signal();
        let (channel, mut deliveries) = self.connect().await?;
        let mut channel_closed = channel.close_signal();

        let config = &self.parts.config;
        self.logger.info(format_args!(
            "Start consume queue '{}', exchange '{}', routing key '{}'",
            config.queue_name, config.exchange, config.routing_key
        ));
        self.set_state(WorkerState::Running);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.logger.info(format_args!("worker closing"));
                    self.set_state(WorkerState::Closing);
                    return Ok(());
                }
                reason = connection_closed.closed() => return Err(WorkerError::ConnectionClosed { reason }),
                reason = channel_closed.closed() => return Err(WorkerError::ChannelClosed { reason }),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(BrokerError::ChannelClosed(reason))) => {
                        return Err(WorkerError::ChannelClosed { reason });
                    }
                    Some(Err(e)) => return Err(WorkerError::Consume(e)),
                    None => return self.stream_ended(shutdown, &connection_closed, &channel_closed),
                },
            };

            self.parts.metrics.received.inc();
            let cancel = shutdown.child_token();
            let processing = self.process(&delivery, channel.as_ref(), cancel.clone());
            tokio::pin!(processing);
            let lost = tokio::select! {
                biased;
                reason = connection_closed.closed() => WorkerError::ConnectionClosed { reason },
                reason = channel_closed.closed() => WorkerError::ChannelClosed { reason },
                result = &mut processing => {
                    result?;
                    continue;
                }
            };

            // the delivery is back in the queue; let the handler wind down
            cancel.cancel();
            if let Err(e) = processing.await {
                self.logger.debug(format_args!("in-flight message after close: {}", e));
            }
            return Err(lost);
        }
    }

    /// The consumer stream finished without a shutdown in progress.
    fn stream_ended(
        &self,
        shutdown: &CancellationToken,
        connection_closed: &CloseSignal,
        channel_closed: &CloseSignal,
    ) -> Result<(), WorkerError> {
        if shutdown.is_cancelled() {
            self.set_state(WorkerState::Closing);
            return Ok(());
        }
        if let Some(reason) = connection_closed.reason() {
            return Err(WorkerError::ConnectionClosed { reason });
        }
        let reason = channel_closed
            .reason()
            .unwrap_or_else(|| "consumer stream ended".to_string());
        Err(WorkerError::ChannelClosed { reason })
    }

    /// Handles one delivery and settles it: ack on success, the rejector on
    /// a message error. A fatal error leaves it unsettled.
    async fn process(
        &self,
        delivery: &Delivery,
        channel: &dyn BrokerChannel,
        cancellation: CancellationToken,
    ) -> Result<(), WorkerError> {
        let ctx = HandlerContext::new(self.logger.clone(), cancellation);

        match self.parts.handler.handle(&ctx, delivery).await {
            Ok(()) => {
                if !delivery.is_auto_ack() {
                    delivery.ack().await.map_err(WorkerError::Ack)?;
                }
                self.parts.metrics.handled.inc();
                self.logger.debug(format_args!("message {:?} done", delivery.message_id()));
            }
            Err(HandlerError::Fatal(e)) => return Err(WorkerError::Fatal(e)),
            Err(err) => {
                self.parts.metrics.rejected.inc();
                self.logger.warn(format_args!(
                    "handler error for message {:?}: {}; rejecting",
                    delivery.message_id(),
                    err
                ));
                if let Some(error_handler) = &self.parts.error_handler {
                    error_handler.handle_error(&err, delivery);
                }
                self.parts
                    .rejector
                    .reject(delivery, channel)
                    .await
                    .map_err(WorkerError::Reject)?;
            }
        }
        Ok(())
    }

    /// Closes the worker's channel. The connection belongs to the pool.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let Some(channel) = self.channel.lock().await.take() else {
            return Ok(());
        };
        if self.state() != WorkerState::Fatal {
            self.set_state(WorkerState::Closing);
        }
        self.logger.info(format_args!("Stop consume queue '{}'", self.parts.config.queue_name));

        let result = if channel.is_closed() { Ok(()) } else { channel.close().await };
        self.set_state(WorkerState::Closed);
        result
    }
}
