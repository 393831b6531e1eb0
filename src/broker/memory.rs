//! An in-process broker implementing the client traits.
//!
//! It models the parts of RabbitMQ the worker framework relies on:
//! direct/topic/fanout routing, the default exchange, equivalence checks on
//! redeclaration, per-channel prefetch, requeue of unacknowledged messages
//! when a channel closes, and dead-lettering (on `reject(requeue = false)`
//! and on per-message or per-queue TTL expiry) with `x-death` bookkeeping.
//!
//! Test hooks let callers fail publishes, refuse connections and simulate
//! broker-initiated connection or channel closes.

use super::{
    republish_properties, Acknowledger, Broker, BrokerChannel, BrokerConnection, CloseNotifier, CloseSignal,
    Delivery, DeliveryStream,
};
use crate::config::{ConsumeOptions, ExchangeOptions, PublishOptions, QueueOptions};
use crate::error::BrokerError;
use crate::headers::{self, X_DEAD_LETTER_EXCHANGE, X_DEAD_LETTER_ROUTING_KEY, X_DEATH, X_MESSAGE_TTL};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::types::{AMQPValue, FieldArray, FieldTable, ShortString};
use lapin::{BasicProperties, ExchangeKind};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const ORIGINAL_EXPIRATION: &str = "original-expiration";

/// A broker living in this process. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    publish_failure: Option<String>,
    connect_failure: Option<String>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, channel: u64) -> Result<(), BrokerError> {
        match self.channels.get(&channel) {
            Some(_) => Ok(()),
            None => Err(BrokerError::ChannelClosed(format!("channel {channel} is closed"))),
        }
    }
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    internal: bool,
    arguments: FieldTable,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueState {
    durable: bool,
    auto_delete: bool,
    exclusive: bool,
    arguments: FieldTable,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

struct Consumer {
    channel: u64,
    tag: String,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Clone)]
struct Message {
    id: u64,
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct ConnectionState {
    notifier: Arc<CloseNotifier>,
}

struct ChannelState {
    connection: u64,
    notifier: Arc<CloseNotifier>,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    message: Message,
}

/// A message waiting in a queue, as seen by [`MemoryBroker::messages`].
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    pub fn expiration(&self) -> Option<&str> {
        self.properties.expiration().as_ref().map(|e| e.as_str())
    }
}

enum Outcome {
    Ack,
    Requeue,
    DeadLetter,
}

impl MemoryBroker {
    /// An empty broker: no exchanges besides the default one, no queues.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every publish fail with `reason` until called with `None`.
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.lock().publish_failure = reason.map(str::to_string);
    }

    /// Makes every connect fail with `reason` until called with `None`.
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.lock().connect_failure = reason.map(str::to_string);
    }

    /// Simulates the broker closing every open connection.
    pub fn close_connections(&self, reason: &str) {
        let mut state = self.lock();
        let open: Vec<u64> = state.connections.keys().copied().collect();
        for id in open {
            if let Some(connection) = state.connections.get(&id) {
                connection.notifier.notify(reason);
            }
            self.close_connection(&mut state, id);
        }
    }

    /// Simulates the broker closing every open channel.
    pub fn close_channels(&self, reason: &str) {
        let mut state = self.lock();
        let open: Vec<u64> = state.channels.keys().copied().collect();
        for id in open {
            if let Some(channel) = state.channels.get(&id) {
                channel.notifier.notify(reason);
            }
            self.close_channel(&mut state, id);
        }
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|e| e.kind.clone())
    }

    /// `(queue, routing_key)` pairs bound on `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.lock().queues.get(name).map(|q| q.arguments.clone())
    }

    /// Messages waiting for delivery in `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages from `queue` delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Snapshot of the messages waiting in `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| StoredMessage {
                        exchange: m.exchange.clone(),
                        routing_key: m.routing_key.clone(),
                        properties: m.properties.clone(),
                        data: m.data.clone(),
                        redelivered: m.redelivered,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Publishes without going through a connection.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        data: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        self.publish_locked(&mut state, exchange, routing_key, false, properties, data)
    }

    fn publish_locked(
        &self,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        data: &[u8],
    ) -> Result<(), BrokerError> {
        if let Some(reason) = &state.publish_failure {
            return Err(BrokerError::Publish(reason.clone()));
        }
        let queues = route(state, exchange, routing_key)?;
        if queues.is_empty() && mandatory {
            return Err(BrokerError::Publish(format!(
                "message to '{exchange}' with routing key '{routing_key}' is unroutable"
            )));
        }
        for queue in queues {
            let message = Message {
                id: state.next_id(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                data: data.to_vec(),
                redelivered: false,
            };
            self.enqueue(state, &queue, message);
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut State, queue: &str, message: Message) {
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };
        let ttl = message_ttl(&message.properties, &target.arguments);
        let id = message.id;
        target.ready.push_back(message);
        if let Some(ttl) = ttl {
            self.schedule_expiry(queue.to_string(), id, ttl);
        }
        self.dispatch(state, queue);
    }

    fn schedule_expiry(&self, queue: String, id: u64, ttl: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("no tokio runtime; message {} in '{}' will not expire", id, queue);
            return;
        };
        let broker = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl)).await;
            broker.expire(&queue, id);
        });
    }

    fn expire(&self, queue: &str, id: u64) {
        let mut state = self.lock();
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = target.ready.iter().position(|m| m.id == id) else {
            return;
        };
        if let Some(message) = target.ready.remove(position) {
            self.dead_letter(&mut state, queue, message, "expired");
        }
    }

    fn dead_letter(&self, state: &mut State, queue: &str, message: Message, reason: &str) {
        let Some(source) = state.queues.get(queue) else {
            return;
        };
        let arguments = source.arguments.inner();
        let Some(exchange) = arguments.get(X_DEAD_LETTER_EXCHANGE).and_then(string_value) else {
            log::debug!("dropping {} message from '{}': no dead-letter exchange", reason, queue);
            return;
        };
        let routing_key = arguments
            .get(X_DEAD_LETTER_ROUTING_KEY)
            .and_then(string_value)
            .unwrap_or_else(|| message.routing_key.clone());

        let mut headers = record_death(
            message.properties.headers().as_ref(),
            queue,
            reason,
            &message.exchange,
            &message.routing_key,
        );
        if let Some(expiration) = message.properties.expiration() {
            headers.insert(
                ShortString::from(ORIGINAL_EXPIRATION),
                AMQPValue::LongString(expiration.as_str().into()),
            );
        }
        let mut properties = republish_properties(&message.properties, headers, None);
        if let Some(timestamp) = message.properties.timestamp() {
            properties = properties.with_timestamp(*timestamp);
        }

        match route(state, &exchange, &routing_key) {
            Ok(queues) => {
                for target in queues {
                    let dead = Message {
                        id: state.next_id(),
                        exchange: exchange.clone(),
                        routing_key: routing_key.clone(),
                        properties: properties.clone(),
                        data: message.data.clone(),
                        redelivered: false,
                    };
                    self.enqueue(state, &target, dead);
                }
            }
            Err(err) => log::debug!("dropping dead-lettered message from '{}': {}", queue, err),
        }
    }

    fn dispatch(&self, state: &mut State, queue: &str) {
        let State { queues, channels, .. } = state;
        let Some(target) = queues.get_mut(queue) else {
            return;
        };
        loop {
            if target.ready.is_empty() || target.consumers.is_empty() {
                return;
            }
            let count = target.consumers.len();
            let chosen = (0..count).map(|offset| (target.cursor + offset) % count).find(|idx| {
                let consumer = &target.consumers[*idx];
                channels.get(&consumer.channel).is_some_and(|channel| {
                    consumer.no_ack
                        || channel.prefetch == 0
                        || channel.unacked.len() < usize::from(channel.prefetch)
                })
            });
            let Some(idx) = chosen else {
                return;
            };
            target.cursor = (idx + 1) % count;

            let (channel_id, no_ack, sender) = {
                let consumer = &target.consumers[idx];
                (consumer.channel, consumer.no_ack, consumer.sender.clone())
            };
            let Some(channel) = channels.get_mut(&channel_id) else {
                return;
            };
            let Some(message) = target.ready.pop_front() else {
                return;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;

            let delivery = Delivery::new(
                tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.properties.clone(),
                message.data.clone(),
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    channel: channel_id,
                    tag,
                    no_ack,
                }),
            )
            .with_auto_ack(no_ack);
            if sender.send(delivery).is_err() {
                target.consumers.remove(idx);
                target.cursor = 0;
                target.ready.push_front(message);
                continue;
            }
            if !no_ack {
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn settle(&self, channel_id: u64, tag: u64, outcome: Outcome) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_open(channel_id)?;
        let Some(unacked) = state
            .channels
            .get_mut(&channel_id)
            .and_then(|channel| channel.unacked.remove(&tag))
        else {
            return Err(BrokerError::PreconditionFailed(format!("unknown delivery tag {tag}")));
        };
        let queue = unacked.queue;
        let mut message = unacked.message;
        match outcome {
            Outcome::Ack => {}
            Outcome::Requeue => {
                message.redelivered = true;
                if let Some(target) = state.queues.get_mut(&queue) {
                    target.ready.push_front(message);
                }
            }
            Outcome::DeadLetter => self.dead_letter(&mut state, &queue, message, "rejected"),
        }
        self.dispatch(&mut state, &queue);
        Ok(())
    }

    /// Forgets the channel and requeues what it had not settled.
    fn close_channel(&self, state: &mut State, channel_id: u64) {
        let Some(channel) = state.channels.remove(&channel_id) else {
            return;
        };
        let unacked = channel.unacked;

        let mut touched = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel_id);
            if queue.consumers.len() != before {
                queue.cursor = 0;
                touched.push(name.clone());
            }
        }
        // newest first so the oldest ends up at the head
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                touched.push(entry.queue);
            }
        }
        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch(state, &queue);
        }
    }

    fn close_connection(&self, state: &mut State, connection_id: u64) {
        if state.connections.remove(&connection_id).is_none() {
            return;
        }
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            self.close_channel(state, id);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        if let Some(reason) = &state.connect_failure {
            return Err(BrokerError::ConnectionClosed(reason.clone()));
        }
        let id = state.next_id();
        let notifier = Arc::new(CloseNotifier::new());
        state.connections.insert(
            id,
            ConnectionState {
                notifier: notifier.clone(),
            },
        );
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            notifier,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    notifier: Arc<CloseNotifier>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed(format!("connection {} is closed", self.id)));
        }
        let id = state.next_id();
        let notifier = Arc::new(CloseNotifier::new());
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                notifier: notifier.clone(),
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            notifier,
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn is_closed(&self) -> bool {
        !self.broker.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        self.broker.close_connection(&mut state, self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    notifier: Arc<CloseNotifier>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if name.is_empty() || name.starts_with("amq.") {
            return Err(BrokerError::PreconditionFailed(format!("exchange name '{name}' is reserved")));
        }
        match state.exchanges.get(name) {
            Some(existing) => {
                let equivalent = existing.kind == kind
                    && existing.durable == options.durable
                    && existing.auto_delete == options.auto_delete
                    && existing.internal == options.internal
                    && existing.arguments == arguments;
                if !equivalent {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "inequivalent arguments for exchange '{name}'"
                    )));
                }
            }
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable: options.durable,
                        auto_delete: options.auto_delete,
                        internal: options.internal,
                        arguments,
                        bindings: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: &QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        match state.queues.get(name) {
            Some(existing) => {
                let equivalent = existing.durable == options.durable
                    && existing.auto_delete == options.auto_delete
                    && existing.exclusive == options.exclusive
                    && existing.arguments == arguments;
                if !equivalent {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "inequivalent arguments for queue '{name}'"
                    )));
                }
            }
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable: options.durable,
                        auto_delete: options.auto_delete,
                        exclusive: options.exclusive,
                        arguments,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
            }
        }
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound { kind: "queue", name: queue.to_string() });
        }
        let Some(target) = state.exchanges.get_mut(exchange) else {
            return Err(BrokerError::NotFound { kind: "exchange", name: exchange.to_string() });
        };
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
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
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        self.broker
            .publish_locked(&mut state, exchange, routing_key, options.mandatory, properties, payload)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            state.ensure_open(self.id)?;
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(BrokerError::NotFound { kind: "queue", name: queue.to_string() });
            };
            if target
                .consumers
                .iter()
                .any(|c| c.channel == self.id && c.tag == consumer_tag)
            {
                return Err(BrokerError::PreconditionFailed(format!(
                    "consumer tag '{consumer_tag}' already in use"
                )));
            }
            target.consumers.push(Consumer {
                channel: self.id,
                tag: consumer_tag.to_string(),
                no_ack: options.auto_ack,
                sender,
            });
            self.broker.dispatch(&mut state, queue);
        }

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });
        Ok(stream.boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn is_closed(&self) -> bool {
        self.broker.lock().ensure_open(self.id).is_err()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        self.broker.close_channel(&mut state, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel: u64,
    tag: u64,
    no_ack: bool,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        if self.no_ack {
            return Ok(());
        }
        self.broker.settle(self.channel, self.tag, Outcome::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        if self.no_ack {
            return Ok(());
        }
        let outcome = if requeue { Outcome::Requeue } else { Outcome::DeadLetter };
        self.broker.settle(self.channel, self.tag, outcome)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.reject(requeue).await
    }
}

fn route(state: &State, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
    if exchange.is_empty() {
        return Ok(state
            .queues
            .contains_key(routing_key)
            .then(|| routing_key.to_string())
            .into_iter()
            .collect());
    }
    let Some(source) = state.exchanges.get(exchange) else {
        return Err(BrokerError::NotFound { kind: "exchange", name: exchange.to_string() });
    };
    let mut queues: Vec<String> = Vec::new();
    for binding in &source.bindings {
        let matched = match &source.kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            _ => binding.routing_key == routing_key,
        };
        if matched && !queues.contains(&binding.queue) {
            queues.push(binding.queue.clone());
        }
    }
    Ok(queues)
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

fn message_ttl(properties: &BasicProperties, arguments: &FieldTable) -> Option<u64> {
    let per_message = properties
        .expiration()
        .as_ref()
        .and_then(|e| e.as_str().parse::<u64>().ok());
    let per_queue = arguments
        .inner()
        .get(X_MESSAGE_TTL)
        .and_then(headers::as_i64)
        .and_then(|ttl| u64::try_from(ttl).ok());
    match (per_message, per_queue) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn string_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(s.to_string()),
        AMQPValue::ShortString(s) => Some(s.to_string()),
        _ => None,
    }
}

fn entry_matches(entry: &AMQPValue, queue: &str, reason: &str) -> bool {
    let AMQPValue::FieldTable(table) = entry else {
        return false;
    };
    let field = |key: &str| table.inner().get(key).and_then(string_value);
    field("queue").as_deref() == Some(queue) && field("reason").as_deref() == Some(reason)
}

/// Adds or bumps the `x-death` entry for `(queue, reason)` and moves it to
/// the front, the way RabbitMQ does.
fn record_death(
    headers: Option<&FieldTable>,
    queue: &str,
    reason: &str,
    exchange: &str,
    routing_key: &str,
) -> FieldTable {
    let mut entries: Vec<AMQPValue> = match headers.and_then(|h| h.inner().get(X_DEATH)) {
        Some(AMQPValue::FieldArray(existing)) => existing.as_slice().to_vec(),
        _ => Vec::new(),
    };
    let previous = entries
        .iter()
        .position(|entry| entry_matches(entry, queue, reason))
        .map(|idx| entries.remove(idx));
    let count = match &previous {
        Some(AMQPValue::FieldTable(table)) => table.inner().get("count").and_then(headers::as_i64).unwrap_or(0) + 1,
        _ => 1,
    };

    let mut entry = FieldTable::default();
    entry.insert("count".into(), AMQPValue::LongLongInt(count));
    entry.insert("reason".into(), AMQPValue::LongString(reason.into()));
    entry.insert("queue".into(), AMQPValue::LongString(queue.into()));
    entry.insert("time".into(), AMQPValue::Timestamp(Utc::now().timestamp().max(0) as u64));
    entry.insert("exchange".into(), AMQPValue::LongString(exchange.into()));
    entry.insert(
        "routing-keys".into(),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(routing_key.into())])),
    );
    entries.insert(0, AMQPValue::FieldTable(entry));

    headers::with_header(headers, X_DEATH, AMQPValue::FieldArray(FieldArray::from(entries)))
}
