//! `lapin` implementation of the broker client traits.

use super::{Acknowledger, Broker, BrokerChannel, BrokerConnection, CloseNotifier, CloseSignal, Delivery, DeliveryStream};
use crate::config::{ConsumeOptions, ExchangeOptions, PublishOptions, QueueOptions};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker {
    connection_name: Option<String>,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }
        let inner = Connection::connect(url, properties).await?;

        let notifier = Arc::new(CloseNotifier::new());
        let on_error = notifier.clone();
        inner.on_error(move |err| {
            log::error!("RabbitMQ connection error: {}", err);
            on_error.notify(err.to_string());
        });

        Ok(Arc::new(AmqpConnection { inner, notifier }))
    }
}

struct AmqpConnection {
    inner: Connection,
    notifier: Arc<CloseNotifier>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let inner = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel {
            inner,
            notifier: Arc::new(CloseNotifier::new()),
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
    notifier: Arc<CloseNotifier>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.inner.basic_qos(prefetch_count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let declare = ExchangeDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            nowait: options.no_wait,
            ..Default::default()
        };
        self.inner.exchange_declare(name, kind, declare, arguments).await?;
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: &QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            nowait: options.no_wait,
            ..Default::default()
        };
        self.inner.queue_declare(name, declare, arguments).await?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: &PublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let publish = BasicPublishOptions {
            mandatory: options.mandatory,
            immediate: options.immediate,
        };
        self.inner
            .basic_publish(exchange, routing_key, publish, payload, properties)
            .await?
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consume = BasicConsumeOptions {
            no_local: options.no_local,
            no_ack: options.auto_ack,
            exclusive: options.exclusive,
            nowait: options.no_wait,
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, consume, options.arguments())
            .await?;

        // lapin reports a broker-side channel close through the consumer
        let notifier = self.notifier.clone();
        let auto_ack = options.auto_ack;
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => Ok(from_lapin(delivery).with_auto_ack(auto_ack)),
            Err(err) => {
                let reason = err.to_string();
                notifier.notify(reason.clone());
                Err(BrokerError::ChannelClosed(reason))
            }
        });
        Ok(stream.boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    let exchange = delivery.exchange.as_str().to_string();
    let routing_key = delivery.routing_key.as_str().to_string();
    Delivery::new(
        delivery.delivery_tag,
        exchange,
        routing_key,
        delivery.redelivered,
        delivery.properties,
        delivery.data,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions { multiple: false, requeue })
            .await?;
        Ok(())
    }
}
