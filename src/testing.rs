//! Shared fixtures for unit tests.

use crate::broker::{Broker, BrokerChannel, Delivery, MemoryBroker};
use crate::config::{Config, ConsumeOptions};
use crate::topology::{self, Layout};
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::sync::Arc;

pub(crate) fn config() -> Config {
    Config::builder("jobs", "amqp://memory")
        .exchange("work")
        .routing_key("jobs.new")
        .build()
}

/// A broker with the topology for `layout` declared and an open channel.
pub(crate) async fn declared(layout: Layout) -> (MemoryBroker, Arc<dyn BrokerChannel>) {
    let broker = MemoryBroker::new();
    let connection = broker.connect("amqp://memory").await.unwrap();
    topology::declare(connection.as_ref(), &config(), layout).await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    (broker, channel)
}

/// Publishes one message to the primary queue and takes its delivery.
pub(crate) async fn receive(broker: &MemoryBroker, channel: &dyn BrokerChannel, properties: BasicProperties) -> Delivery {
    receive_with(broker, channel, properties, &ConsumeOptions::default()).await
}

/// Like [`receive`], consuming with `auto_ack`.
pub(crate) async fn receive_auto_acked(
    broker: &MemoryBroker,
    channel: &dyn BrokerChannel,
    properties: BasicProperties,
) -> Delivery {
    let options = ConsumeOptions {
        auto_ack: true,
        ..ConsumeOptions::default()
    };
    receive_with(broker, channel, properties, &options).await
}

async fn receive_with(
    broker: &MemoryBroker,
    channel: &dyn BrokerChannel,
    properties: BasicProperties,
    options: &ConsumeOptions,
) -> Delivery {
    broker.publish("work", "jobs.new", properties, b"payload").unwrap();
    let mut stream = channel.consume("jobs", "fixture", options).await.unwrap();
    stream.next().await.unwrap().unwrap()
}
