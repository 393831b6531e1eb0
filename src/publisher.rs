//! Publishing messages into the broker.
//!
//! [`publish_message`] and [`publish_text`] dial, publish once and hang up.
//! [`Publisher`] keeps a connection and channel around for repeated pushes
//! and redials when the broker has closed them.

use crate::broker::{Broker, BrokerChannel, BrokerConnection};
use crate::config::{Config, PublishOptions};
use crate::error::WorkerError;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::Mutex;

const TEXT_PLAIN: &str = "text/plain";

/// Declares `config.exchange` and publishes `body` to it with
/// `config.routing_key`, on a connection opened for this message only.
///
/// The default exchange (`""`) is not declared.
pub async fn publish_message(
    broker: &dyn Broker,
    config: &Config,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), WorkerError> {
    let connection = broker
        .connect(&config.connection_url)
        .await
        .map_err(WorkerError::Connection)?;

    let result = publish_on(connection.as_ref(), config, body, properties).await;

    if let Err(e) = connection.close().await {
        log::warn!("can not close connection: {}", e);
    }
    result
}

/// [`publish_message`] with content type `text/plain`.
pub async fn publish_text(broker: &dyn Broker, config: &Config, body: &[u8]) -> Result<(), WorkerError> {
    let properties = BasicProperties::default().with_content_type(TEXT_PLAIN.into());
    publish_message(broker, config, body, properties).await
}

async fn publish_on(
    connection: &dyn BrokerConnection,
    config: &Config,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), WorkerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(WorkerError::Connection)?;
    let message_id = properties.message_id().as_ref().map(|id| id.to_string());

    let result = declare_and_publish(channel.as_ref(), config, body, properties).await;

    if let Err(e) = channel.close().await {
        log::warn!("can not close channel: {}", e);
    }
    if result.is_ok() {
        log::info!(
            "Send message {:?} to exchange '{}' -> '{}'",
            message_id,
            config.exchange,
            config.routing_key
        );
    }
    result
}

async fn declare_and_publish(
    channel: &dyn BrokerChannel,
    config: &Config,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), WorkerError> {
    if !config.exchange.is_empty() {
        let options = &config.exchange_options;
        channel
            .exchange_declare(&config.exchange, options.exchange_kind(), options, options.arguments())
            .await
            .map_err(|e| WorkerError::topology(format!("declare exchange '{}'", config.exchange), e))?;
    }
    channel
        .publish(&config.exchange, &config.routing_key, &config.publish_options, body, properties)
        .await
        .map_err(WorkerError::Publish)
}

struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Session {
    fn is_closed(&self) -> bool {
        self.connection.is_closed() || self.channel.is_closed()
    }
}

/// A reusable publisher. Connects on the first push.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    url: String,
    options: PublishOptions,
    session: Mutex<Option<Session>>,
}

impl Publisher {
    /// Nothing is dialed until the first [`push`](Self::push).
    pub fn new(broker: impl Broker + 'static, url: impl Into<String>) -> Self {
        Self {
            broker: Arc::new(broker),
            url: url.into(),
            options: PublishOptions::default(),
            session: Mutex::new(None),
        }
    }

    pub fn with_publish_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }

    async fn open(&self) -> Result<Session, WorkerError> {
        let connection = self.broker.connect(&self.url).await.map_err(WorkerError::Connection)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(WorkerError::Connection)?;
        Ok(Session { connection, channel })
    }

    /// Publishes to `exchange` with `routing_key`. Nothing is declared.
    pub async fn push(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), WorkerError> {
        let mut guard = self.session.lock().await;
        let session = match guard.take() {
            Some(session) if !session.is_closed() => session,
            stale => {
                if let Some(stale) = stale {
                    log::info!("Publisher session is closed, reconnecting.");
                    if !stale.connection.is_closed() {
                        let _ = stale.connection.close().await;
                    }
                }
                self.open().await?
            }
        };

        let result = session
            .channel
            .publish(exchange, routing_key, &self.options, body, properties)
            .await
            .map_err(WorkerError::Publish);
        *guard = Some(session);
        result
    }

    /// Closes the channel, then the connection. A later push reconnects.
    pub async fn close(&self) -> Result<(), WorkerError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        if !session.channel.is_closed() {
            if let Err(e) = session.channel.close().await {
                log::warn!("can not close channel: {}", e);
            }
        }
        if !session.connection.is_closed() {
            session.connection.close().await.map_err(WorkerError::Connection)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::testing;
    use crate::topology::Layout;

    #[tokio::test]
    async fn publish_message_declares_and_hangs_up() {
        let (broker, _channel) = testing::declared(Layout::Simple).await;
        let before = broker.open_connections();

        publish_text(&broker, &testing::config(), b"hello").await.unwrap();

        let queued = broker.messages("jobs");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].data, b"hello");
        assert_eq!(
            queued[0].properties.content_type().as_ref().map(|c| c.as_str()),
            Some("text/plain")
        );
        assert_eq!(broker.open_connections(), before);
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let (broker, _channel) = testing::declared(Layout::Simple).await;
        broker.fail_publishes(Some("nack"));

        let err = publish_text(&broker, &testing::config(), b"hello").await.unwrap_err();
        assert!(matches!(err, WorkerError::Publish(_)));
    }

    #[tokio::test]
    async fn conflicting_exchange_is_a_topology_error() {
        let (broker, _channel) = testing::declared(Layout::Simple).await;
        let mut config = testing::config();
        config.exchange_options.kind = "fanout".to_string();

        let err = publish_text(&broker, &config, b"hello").await.unwrap_err();
        assert!(matches!(err, WorkerError::Topology { .. }));
    }

    #[tokio::test]
    async fn publisher_connects_lazily_and_reconnects() {
        let (broker, _channel) = testing::declared(Layout::Simple).await;
        let publisher = Publisher::new(broker.clone(), "amqp://memory");
        let baseline = broker.open_connections();

        publisher.push("work", "jobs.new", b"1", BasicProperties::default()).await.unwrap();
        publisher.push("work", "jobs.new", b"2", BasicProperties::default()).await.unwrap();
        assert_eq!(broker.open_connections(), baseline + 1);

        broker.close_connections("broker restart");
        publisher.push("work", "jobs.new", b"3", BasicProperties::default()).await.unwrap();
        assert_eq!(broker.open_connections(), 1);

        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.ready_count("jobs"), 3);
    }

    #[tokio::test]
    async fn unknown_exchange_fails_the_push() {
        let publisher = Publisher::new(MemoryBroker::new(), "amqp://memory");
        let err = publisher
            .push("missing", "key", b"x", BasicProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Publish(_)));
    }
}
