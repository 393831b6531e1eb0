//! Defines the traits workers call for every delivery.

use crate::broker::Delivery;
use crate::error::BoxError;
use crate::logging::Logger;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a handler failed.
///
/// A `Message` error is about this message alone: it is routed through the
/// pool's rejection policy and the worker carries on. A `Fatal` error stops
/// the worker and, through it, the pool. The message is not rejected: it
/// stays unacknowledged until the worker's channel closes, then the broker
/// redelivers it to a sibling worker or to the next pool started on the
/// queue.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(#[source] BoxError),

    #[error("fatal: {0}")]
    Fatal(#[source] BoxError),
}

impl HandlerError {
    pub fn message(err: impl Into<BoxError>) -> Self {
        HandlerError::Message(err.into())
    }

    pub fn fatal(err: impl Into<BoxError>) -> Self {
        HandlerError::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

/// What a handler gets besides the delivery.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    logger: Logger,
    cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn new(logger: Logger, cancellation: CancellationToken) -> Self {
        Self { logger, cancellation }
    }

    /// Logger tagged with the worker's name.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Cancelled when the pool shuts down or the broker closes the worker's
    /// connection or channel. The worker still waits for the handler to
    /// return; long-running handlers can watch this to finish early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Processes raw deliveries.
///
/// Workers ack after `Ok(())` and never before, so a handler may be called
/// more than once for the same message.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, ctx: &HandlerContext, delivery: &Delivery) -> Result<(), HandlerError> {
        (**self).handle(ctx, delivery).await
    }
}

/// Observes non-fatal handler failures before the message is rejected.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, error: &HandlerError, delivery: &Delivery);
}

impl<F> ErrorHandler for F
where
    F: Fn(&HandlerError, &Delivery) + Send + Sync,
{
    fn handle_error(&self, error: &HandlerError, delivery: &Delivery) {
        self(error, delivery)
    }
}

/// A trait for processing JSON messages of one type.
///
/// Implement this trait for your specific message type and business logic,
/// then wrap it in a [`JsonHandler`] to hand it to a pool.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    /// Must be deserializable from JSON.
    type MessageType: DeserializeOwned + Send + Sync;

    /// Processes a single deserialized message.
    async fn handle_message(&self, ctx: &HandlerContext, message: Self::MessageType) -> Result<(), HandlerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Adapts a [`MessageHandler`] into a [`Handler`] by decoding the body as JSON.
///
/// A body that does not decode is a message error, so it goes through the
/// rejection policy like any other failure.
pub struct JsonHandler<H> {
    inner: H,
}

impl<H: MessageHandler> JsonHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: MessageHandler> Handler for JsonHandler<H> {
    async fn handle(&self, ctx: &HandlerContext, delivery: &Delivery) -> Result<(), HandlerError> {
        let message: H::MessageType = delivery.json().map_err(|e| {
            ctx.logger().error(format_args!(
                "{}: failed to parse message {:?}: {}",
                self.inner.handler_name(),
                delivery.message_id(),
                e
            ));
            HandlerError::message(e)
        })?;
        self.inner.handle_message(ctx, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Acknowledger;
    use crate::error::BrokerError;
    use lapin::BasicProperties;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn reject(&self, _requeue: bool) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn delivery(body: &[u8]) -> Delivery {
        Delivery::new(1, "", "jobs", false, BasicProperties::default(), body.to_vec(), Box::new(NoopAcker))
    }

    fn context() -> HandlerContext {
        HandlerContext::new(Logger::new("worker-0"), CancellationToken::new())
    }

    #[derive(Deserialize)]
    struct Order {
        id: u32,
    }

    #[derive(Default)]
    struct OrderHandler {
        last: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for OrderHandler {
        type MessageType = Order;

        async fn handle_message(&self, _ctx: &HandlerContext, message: Order) -> Result<(), HandlerError> {
            if message.id == 0 {
                return Err(HandlerError::fatal("order id 0 means the feed is broken"));
            }
            self.last.store(message.id, Ordering::SeqCst);
            Ok(())
        }

        fn handler_name(&self) -> &str {
            "OrderHandler"
        }
    }

    #[tokio::test]
    async fn json_handler_decodes_and_forwards() {
        let handler = JsonHandler::new(OrderHandler::default());
        handler.handle(&context(), &delivery(br#"{"id":42}"#)).await.unwrap();
        assert_eq!(handler.inner().last.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn undecodable_body_is_a_message_error() {
        let handler = JsonHandler::new(OrderHandler::default());
        let err = handler.handle(&context(), &delivery(b"not json")).await.unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn fatal_errors_pass_through() {
        let handler: Arc<dyn Handler> = Arc::new(JsonHandler::new(OrderHandler::default()));
        let err = handler.handle(&context(), &delivery(br#"{"id":0}"#)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn closures_are_error_handlers() {
        let seen = AtomicU32::new(0);
        let on_error = |_: &HandlerError, _: &Delivery| {
            seen.fetch_add(1, Ordering::SeqCst);
        };
        on_error.handle_error(&HandlerError::message("boom"), &delivery(b""));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
