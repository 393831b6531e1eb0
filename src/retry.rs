//! Retry policy: fixed-delay redelivery through broker dead-lettering.
//!
//! The primary queue dead-letters rejected messages to `<queue>.retry`,
//! which holds them for `ttl` seconds and dead-letters them back. The broker
//! counts the trips in `x-death`; once that count reaches `max_retry - 1`
//! the next failure sends the message to `<queue>.fail` instead.

use crate::broker::{BrokerChannel, Delivery};
use crate::config::{Config, PublishOptions};
use crate::error::BrokerError;
use crate::rejector::{ack_republished, reject_without_requeue, republish, Rejector};
use crate::topology::Names;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Configuration for message redelivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Seconds a rejected message waits in the retry queue.
    pub ttl: u32,
    /// Total deliveries before the message is parked in the fail queue.
    pub max_retry: u32,
}

impl RetryPolicy {
    /// `max_retry = 0` sends every failure straight to the fail queue.
    pub fn new(ttl: u32, max_retry: u32) -> Self {
        Self { ttl, max_retry }
    }

    /// Whether a message already dead-lettered `deaths` times is out of attempts.
    pub fn is_exhausted(&self, deaths: u32) -> bool {
        deaths.saturating_add(1) >= self.max_retry
    }
}

/// Rejects to the retry queue until the attempts run out, then parks the
/// message in the fail queue.
#[derive(Debug, Clone)]
pub struct RetryRejector {
    policy: RetryPolicy,
    names: Names,
    publish_options: PublishOptions,
}

impl RetryRejector {
    pub fn new(policy: RetryPolicy, config: &Config) -> Self {
        Self {
            policy,
            names: Names::new(config),
            publish_options: config.publish_options.clone(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Rejector for RetryRejector {
    async fn reject(&self, delivery: &Delivery, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        let deaths = delivery.death_count();
        if !self.policy.is_exhausted(deaths) {
            log::debug!("Message {:?} rejected for retry #{}.", delivery.message_id(), deaths + 1);
            return reject_without_requeue(delivery).await;
        }

        let headers = delivery.headers().cloned().unwrap_or_default();
        republish(
            channel,
            &self.names.topic_exchange,
            &self.names.fail_key,
            &self.publish_options,
            delivery,
            headers,
            None,
        )
        .await?;
        log::warn!(
            "Message {:?} sent to '{}' after {} attempts.",
            delivery.message_id(),
            self.names.fail_queue,
            deaths + 1
        );
        ack_republished(delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{self, with_header, X_DEATH};
    use crate::testing;
    use crate::topology::Layout;
    use lapin::types::{AMQPValue, FieldArray, FieldTable};
    use lapin::BasicProperties;

    fn rejector() -> RetryRejector {
        RetryRejector::new(RetryPolicy::new(5, 5), &testing::config())
    }

    fn died(count: i64) -> BasicProperties {
        let mut entry = FieldTable::default();
        entry.insert("queue".into(), AMQPValue::LongString("jobs".into()));
        entry.insert("count".into(), AMQPValue::LongLongInt(count));
        let deaths = FieldArray::from(vec![AMQPValue::FieldTable(entry)]);
        BasicProperties::default().with_headers(with_header(None, X_DEATH, AMQPValue::FieldArray(deaths)))
    }

    #[test]
    fn exhaustion_threshold() {
        let policy = RetryPolicy::new(5, 5);
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
        assert!(RetryPolicy::new(5, 1).is_exhausted(0));
    }

    #[tokio::test]
    async fn fresh_message_is_dead_lettered_to_retry_queue() {
        let (broker, channel) = testing::declared(Layout::Retry { ttl: 5 }).await;
        let delivery = testing::receive(&broker, channel.as_ref(), BasicProperties::default()).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        let retrying = broker.messages("jobs.retry");
        assert_eq!(retrying.len(), 1);
        assert_eq!(headers::death_count(retrying[0].headers()), 1);
        assert_eq!(broker.ready_count("jobs.fail"), 0);
    }

    #[tokio::test]
    async fn below_the_limit_keeps_retrying() {
        let (broker, channel) = testing::declared(Layout::Retry { ttl: 5 }).await;
        let delivery = testing::receive(&broker, channel.as_ref(), died(3)).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        assert_eq!(broker.ready_count("jobs.retry"), 1);
        assert_eq!(broker.ready_count("jobs.fail"), 0);
    }

    #[tokio::test]
    async fn at_the_limit_goes_to_fail_queue() {
        let (broker, channel) = testing::declared(Layout::Retry { ttl: 5 }).await;
        let delivery = testing::receive(&broker, channel.as_ref(), died(4)).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        assert_eq!(broker.ready_count("jobs.retry"), 0);
        let failed = broker.messages("jobs.fail");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].exchange, "work.topic");
        assert_eq!(failed[0].routing_key, "jobs.new.fail");
        assert_eq!(headers::death_count(failed[0].headers()), 4);
        assert!(delivery.is_settled());
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn auto_acked_delivery_is_not_settled_again() {
        let (broker, channel) = testing::declared(Layout::Retry { ttl: 5 }).await;
        let delivery = testing::receive_auto_acked(&broker, channel.as_ref(), died(4)).await;

        rejector().reject(&delivery, channel.as_ref()).await.unwrap();

        assert_eq!(broker.messages("jobs.fail").len(), 1);
        assert!(!delivery.is_settled());
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn failed_publish_is_returned() {
        let (broker, channel) = testing::declared(Layout::Retry { ttl: 5 }).await;
        let delivery = testing::receive(&broker, channel.as_ref(), died(4)).await;
        broker.fail_publishes(Some("nack"));

        assert!(rejector().reject(&delivery, channel.as_ref()).await.is_err());
        assert!(!delivery.is_settled());
    }
}
