//! Rejection policies applied when a handler fails with a message error.

use crate::broker::{republish_properties, BrokerChannel, Delivery};
use crate::config::PublishOptions;
use crate::error::BrokerError;
use async_trait::async_trait;
use lapin::types::FieldTable;

/// Decides what happens to a delivery whose handler failed.
///
/// Implementations settle the delivery themselves. `channel` is the
/// worker's own channel, for policies that republish.
#[async_trait]
pub trait Rejector: Send + Sync {
    async fn reject(&self, delivery: &Delivery, channel: &dyn BrokerChannel) -> Result<(), BrokerError>;
}

/// Rejects without requeue. The broker drops the message, or dead-letters
/// it if the queue has a dead-letter exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRejector;

#[async_trait]
impl Rejector for EmptyRejector {
    async fn reject(&self, delivery: &Delivery, _channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        reject_without_requeue(delivery).await
    }
}

/// Rejects without requeue. A delivery consumed with `auto_ack` is already
/// settled, so there is nothing to send.
pub(crate) async fn reject_without_requeue(delivery: &Delivery) -> Result<(), BrokerError> {
    if delivery.is_auto_ack() {
        log::warn!("Message {:?} was auto-acked and cannot be rejected.", delivery.message_id());
        return Ok(());
    }
    delivery.reject(false).await
}

/// Acks a delivery once its copy has been republished.
pub(crate) async fn ack_republished(delivery: &Delivery) -> Result<(), BrokerError> {
    if delivery.is_auto_ack() {
        return Ok(());
    }
    delivery.ack().await
}

/// Publishes a copy of `delivery` with new headers and expiration.
pub(crate) async fn republish(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    options: &PublishOptions,
    delivery: &Delivery,
    headers: FieldTable,
    expiration: Option<String>,
) -> Result<(), BrokerError> {
    let properties = republish_properties(&delivery.properties, headers, expiration);
    channel
        .publish(exchange, routing_key, options, &delivery.data, properties)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::topology::Layout;
    use lapin::BasicProperties;

    #[tokio::test]
    async fn empty_rejector_drops_the_message() {
        let (broker, channel) = testing::declared(Layout::Simple).await;
        let delivery = testing::receive(&broker, channel.as_ref(), BasicProperties::default()).await;

        EmptyRejector.reject(&delivery, channel.as_ref()).await.unwrap();

        assert!(delivery.is_settled());
        assert_eq!(broker.ready_count("jobs"), 0);
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn auto_acked_delivery_is_not_rejected_again() {
        let (broker, channel) = testing::declared(Layout::Simple).await;
        let delivery = testing::receive_auto_acked(&broker, channel.as_ref(), BasicProperties::default()).await;

        EmptyRejector.reject(&delivery, channel.as_ref()).await.unwrap();

        assert!(!delivery.is_settled());
        assert!(!channel.is_closed());
        assert_eq!(broker.ready_count("jobs"), 0);
    }
}
