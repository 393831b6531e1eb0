//! Repeat policy: progressively delayed redelivery through `<queue>.wait`.
//!
//! A failed message is republished to the wait queue with a per-message
//! expiration; when it expires the broker dead-letters it back to the
//! primary exchange. The attempt number rides along in `repeat_number`.
//! Delays grow linearly: `ttl_base`, `ttl_base + ttl_range`,
//! `ttl_base + 2 * ttl_range`, ... seconds. After `max_repeat` repeats the
//! message goes to `<queue>.fail`.

use crate::broker::{BrokerChannel, Delivery};
use crate::config::{Config, PublishOptions};
use crate::error::BrokerError;
use crate::headers::{with_header, without_header, REPEAT_NUMBER};
use crate::rejector::{ack_republished, republish, Rejector};
use crate::topology::Names;
use async_trait::async_trait;
use lapin::types::AMQPValue;
use serde::{Deserialize, Serialize};

/// Delay schedule for the repeat policy. Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatPolicy {
    pub ttl_base: u32,
    pub ttl_range: u32,
    pub max_repeat: u32,
}

impl RepeatPolicy {
    pub fn new(ttl_base: u32, ttl_range: u32, max_repeat: u32) -> Self {
        Self {
            ttl_base,
            ttl_range,
            max_repeat,
        }
    }

    /// Expiration in milliseconds for the `attempt`-th repeat (1-based).
    pub fn expiration_ms(&self, attempt: u32) -> u64 {
        let steps = u64::from(attempt.saturating_sub(1));
        (u64::from(self.ttl_base) + u64::from(self.ttl_range) * steps) * 1000
    }
}

/// Republishes failed messages to the wait queue, then to the fail queue.
#[derive(Debug, Clone)]
pub struct RepeatableRejector {
    policy: RepeatPolicy,
    names: Names,
    publish_options: PublishOptions,
}

impl RepeatableRejector {
    pub fn new(policy: RepeatPolicy, config: &Config) -> Self {
        Self {
            policy,
            names: Names::new(config),
            publish_options: config.publish_options.clone(),
        }
    }

    pub fn policy(&self) -> &RepeatPolicy {
        &self.policy
    }
}

#[async_trait]
impl Rejector for RepeatableRejector {
    async fn reject(&self, delivery: &Delivery, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        let current = delivery.repeat_number();
        let exchange = &self.names.topic_exchange;

        if current >= self.policy.max_repeat {
            let headers = without_header(delivery.headers(), REPEAT_NUMBER);
            republish(channel, exchange, &self.names.fail_key, &self.publish_options, delivery, headers, None).await?;
            log::warn!(
                "Message {:?} sent to '{}' after {} repeats.",
                delivery.message_id(),
                self.names.fail_queue,
                current
            );
        } else {
            let next = current + 1;
            let expiration = self.policy.expiration_ms(next).to_string();
            let headers = with_header(delivery.headers(), REPEAT_NUMBER, AMQPValue::LongLongInt(i64::from(next)));
            republish(
                channel,
                exchange,
                &self.names.wait_key,
                &self.publish_options,
                delivery,
                headers,
                Some(expiration.clone()),
            )
            .await?;
            log::info!(
                "Message {:?} sent to '{}' with ttl = {}ms (repeat {}).",
                delivery.message_id(),
                self.names.wait_queue,
                expiration,
                next
            );
        }

        ack_republished(delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;
    use crate::testing;
    use crate::topology::Layout;
    use lapin::BasicProperties;

    fn rejector() -> RepeatableRejector {
        RepeatableRejector::new(RepeatPolicy::new(1, 10, 3), &testing::config())
    }

    fn with_repeat(n: i64) -> BasicProperties {
        BasicProperties::default()
            .with_message_id("m-1".into())
            .with_headers(with_header(None, REPEAT_NUMBER, AMQPValue::LongLongInt(n)))
    }

    #[test]
    fn expiration_grows_linearly() {
        let policy = RepeatPolicy::new(1, 10, 3);
        assert_eq!(policy.expiration_ms(1), 1_000);
        assert_eq!(policy.expiration_ms(2), 11_000);
        assert_eq!(policy.expiration_ms(3), 21_000);
    }

    #[tokio::test]
    async fn first_failure_goes_to_wait_queue() {
        let (broker, channel) = testing::declared(Layout::Repeat).await;
        let properties = BasicProperties::default().with_message_id("m-1".into());
        let delivery = testing::receive(&broker, channel.as_ref(), properties).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        let waiting = broker.messages("jobs.wait");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].expiration(), Some("1000"));
        assert_eq!(headers::repeat_number(waiting[0].headers()), 1);
        assert_eq!(waiting[0].data, b"payload");
        assert_eq!(waiting[0].properties.message_id().as_ref().map(|m| m.as_str()), Some("m-1"));
        assert!(delivery.is_settled());
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn later_failures_wait_longer() {
        let (broker, channel) = testing::declared(Layout::Repeat).await;
        let delivery = testing::receive(&broker, channel.as_ref(), with_repeat(2)).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        let waiting = broker.messages("jobs.wait");
        assert_eq!(waiting[0].expiration(), Some("21000"));
        assert_eq!(headers::repeat_number(waiting[0].headers()), 3);
    }

    #[tokio::test]
    async fn exhausted_message_goes_to_fail_queue_without_counter() {
        let (broker, channel) = testing::declared(Layout::Repeat).await;
        let properties = with_repeat(3).with_expiration("21000".into());
        let delivery = testing::receive(&broker, channel.as_ref(), properties).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        assert_eq!(broker.ready_count("jobs.wait"), 0);
        let failed = broker.messages("jobs.fail");
        assert_eq!(failed.len(), 1);
        assert!(failed[0].expiration().is_none());
        let headers = failed[0].headers().cloned().unwrap_or_default();
        assert!(!headers.inner().contains_key(REPEAT_NUMBER));
    }

    #[tokio::test]
    async fn unreadable_counter_starts_over() {
        let (broker, channel) = testing::declared(Layout::Repeat).await;
        let garbage = with_header(None, REPEAT_NUMBER, AMQPValue::LongString("many".into()));
        let properties = BasicProperties::default().with_headers(garbage);
        let delivery = testing::receive(&broker, channel.as_ref(), properties).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        let waiting = broker.messages("jobs.wait");
        assert_eq!(headers::repeat_number(waiting[0].headers()), 1);
        assert_eq!(waiting[0].expiration(), Some("1000"));
    }

    #[tokio::test]
    async fn auto_acked_delivery_is_republished_without_ack() {
        let (broker, channel) = testing::declared(Layout::Repeat).await;
        let delivery = testing::receive_auto_acked(&broker, channel.as_ref(), BasicProperties::default()).await;
        assert!(delivery.is_auto_ack());

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        assert_eq!(broker.messages("jobs.wait").len(), 1);
        assert!(!delivery.is_settled());
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn publish_failure_leaves_message_unacked() {
        let (broker, channel) = testing::declared(Layout::Repeat).await;
        let delivery = testing::receive(&broker, channel.as_ref(), BasicProperties::default()).await;
        broker.fail_publishes(Some("nack"));

        let err = rejector().reject(&delivery, channel.as_ref()).await.unwrap_err();

        assert!(matches!(err, BrokerError::Publish(_)));
        assert!(!delivery.is_settled());
        assert_eq!(broker.unacked_count("jobs"), 1);
        assert_eq!(broker.messages("jobs.wait").len(), 0);
    }
}
