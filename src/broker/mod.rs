//! The broker client interface the workers are written against.
//!
//! [`amqp`] implements it on top of `lapin`; [`memory`] is an in-process
//! broker with the same routing, prefetch and dead-letter behavior, used by
//! the test suite and for running handlers locally.

pub mod amqp;
pub mod memory;

use crate::config::{ConsumeOptions, ExchangeOptions, PublishOptions, QueueOptions};
use crate::error::BrokerError;
use crate::headers;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Stream of deliveries produced by [`BrokerChannel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Dials connections.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One physical connection, shared by every channel opened on it.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolves when the broker closes the connection. A close requested by
    /// this client never resolves it.
    fn close_signal(&self) -> CloseSignal;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel: declarations, publishing and consuming.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limits the number of unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: &QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: &PublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Resolves when the broker closes the channel.
    fn close_signal(&self) -> CloseSignal;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// An inbound message and the handle to settle it.
///
/// Exactly one of [`ack`](Self::ack), [`reject`](Self::reject) or
/// [`nack`](Self::nack) takes effect; later calls fail with
/// [`BrokerError::AlreadyAcknowledged`].
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
    settled: AtomicBool,
    auto_ack: bool,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            properties,
            data,
            acker,
            settled: AtomicBool::new(false),
            auto_ack: false,
        }
    }

    /// Marks a delivery consumed with `no_ack`. The broker settled it when it
    /// was sent, so it must not be acked or rejected again.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    fn settle(&self) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyAcknowledged);
        }
        Ok(())
    }

    /// Acknowledges this delivery only (`multiple = false`).
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.settle()?;
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle()?;
        self.acker.reject(requeue).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle()?;
        self.acker.nack(requeue).await
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    /// Repeats already scheduled for this message, 0 when unknown.
    pub fn repeat_number(&self) -> u32 {
        headers::repeat_number(self.headers())
    }

    /// Dead-letter count the broker recorded last, 0 when unknown.
    pub fn death_count(&self) -> u32 {
        headers::death_count(self.headers())
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id())
            .field("len", &self.data.len())
            .field("settled", &self.is_settled())
            .field("auto_ack", &self.auto_ack)
            .finish()
    }
}

/// Copies the properties a republished message keeps, replacing its headers
/// and expiration. The timestamp is not carried over.
pub(crate) fn republish_properties(
    source: &BasicProperties,
    headers: FieldTable,
    expiration: Option<String>,
) -> BasicProperties {
    let mut properties = BasicProperties::default().with_headers(headers);
    if let Some(value) = source.content_type() {
        properties = properties.with_content_type(value.clone());
    }
    if let Some(value) = source.content_encoding() {
        properties = properties.with_content_encoding(value.clone());
    }
    if let Some(value) = source.delivery_mode() {
        properties = properties.with_delivery_mode(*value);
    }
    if let Some(value) = source.priority() {
        properties = properties.with_priority(*value);
    }
    if let Some(value) = source.correlation_id() {
        properties = properties.with_correlation_id(value.clone());
    }
    if let Some(value) = source.reply_to() {
        properties = properties.with_reply_to(value.clone());
    }
    if let Some(value) = source.message_id() {
        properties = properties.with_message_id(value.clone());
    }
    if let Some(value) = source.kind() {
        properties = properties.with_type(value.clone());
    }
    if let Some(value) = source.user_id() {
        properties = properties.with_user_id(value.clone());
    }
    if let Some(value) = source.app_id() {
        properties = properties.with_app_id(value.clone());
    }
    if let Some(expiration) = expiration {
        properties = properties.with_expiration(expiration.into());
    }
    properties
}

/// Resolves with the reason once the broker closes a connection or channel.
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<String>>,
}

impl CloseSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    /// The close reason, if the broker has closed already.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Waits for a broker-initiated close. If the notifying side goes away
    /// without reporting one, this never completes.
    pub async fn closed(&mut self) -> String {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sending half of [`CloseSignal`]; the first reason wins.
pub(crate) struct CloseNotifier {
    tx: watch::Sender<Option<String>>,
}

impl CloseNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn signal(&self) -> CloseSignal {
        CloseSignal { rx: self.tx.subscribe() }
    }

    pub(crate) fn notify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingAcker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn reject(&self, _requeue: bool) -> Result<(), BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery(calls: Arc<AtomicUsize>) -> Delivery {
        Delivery::new(
            1,
            "ex",
            "rk",
            false,
            BasicProperties::default().with_message_id("m-1".into()),
            b"{\"id\":7}".to_vec(),
            Box::new(CountingAcker { calls }),
        )
    }

    #[tokio::test]
    async fn delivery_settles_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let delivery = delivery(calls.clone());

        delivery.ack().await.unwrap();
        assert!(matches!(delivery.ack().await, Err(BrokerError::AlreadyAcknowledged)));
        assert!(matches!(delivery.reject(false).await, Err(BrokerError::AlreadyAcknowledged)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(delivery.is_settled());
    }

    #[test]
    fn delivery_accessors() {
        #[derive(serde::Deserialize)]
        struct Body {
            id: u32,
        }

        let delivery = delivery(Arc::default());
        assert_eq!(delivery.message_id(), Some("m-1"));
        assert_eq!(delivery.repeat_number(), 0);
        assert!(!delivery.is_auto_ack());
        assert_eq!(delivery.json::<Body>().unwrap().id, 7);
        assert!(delivery.with_auto_ack(true).is_auto_ack());
    }

    #[test]
    fn republish_keeps_identity_and_drops_timestamp() {
        let source = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id("m-1".into())
            .with_app_id("billing".into())
            .with_type("invoice.created".into())
            .with_timestamp(42)
            .with_expiration("1000".into());

        let copy = republish_properties(&source, FieldTable::default(), None);
        assert_eq!(copy.content_type().as_ref().map(|v| v.as_str()), Some("application/json"));
        assert_eq!(copy.message_id().as_ref().map(|v| v.as_str()), Some("m-1"));
        assert_eq!(copy.app_id().as_ref().map(|v| v.as_str()), Some("billing"));
        assert_eq!(copy.kind().as_ref().map(|v| v.as_str()), Some("invoice.created"));
        assert!(copy.timestamp().is_none());
        assert!(copy.expiration().is_none());

        let copy = republish_properties(&source, FieldTable::default(), Some("11000".into()));
        assert_eq!(copy.expiration().as_ref().map(|v| v.as_str()), Some("11000"));
    }

    #[tokio::test]
    async fn close_signal_first_reason_wins() {
        let notifier = CloseNotifier::new();
        let mut signal = notifier.signal();
        assert!(signal.reason().is_none());

        notifier.notify("broker restart");
        notifier.notify("second");
        assert_eq!(signal.closed().await, "broker restart");

        // late subscribers see the reason immediately
        let mut late = notifier.signal();
        assert_eq!(late.closed().await, "broker restart");
    }

    #[tokio::test]
    async fn never_signal_stays_pending() {
        let mut signal = CloseSignal::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.closed()).await;
        assert!(waited.is_err());
    }
}
