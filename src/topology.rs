//! Queue and exchange topology for the pool layouts.
//!
//! Every pool consumes `<queue>`, optionally bound to `<exchange>` with
//! `<routing_key>`. Retry and repeat pools add a topic exchange
//! `<exchange>.topic` and derived queues bound on it:
//!
//! | layout | queue           | bound with           | dead-letters to              |
//! |--------|-----------------|----------------------|------------------------------|
//! | repeat | `<queue>.wait`  | `<routing_key>.wait` | `<exchange>` / `<routing_key>` |
//! | retry  | `<queue>.retry` | `<routing_key>.retry`| `<exchange>` / `<routing_key>` |
//! | both   | `<queue>.fail`  | `<routing_key>.fail` | nowhere                      |
//!
//! In the retry layout the primary queue itself dead-letters to
//! `<exchange>.topic` / `<routing_key>.retry`, and `<queue>.retry` holds
//! messages for a fixed TTL.

use crate::broker::{BrokerChannel, BrokerConnection};
use crate::config::{Config, QueueOptions};
use crate::error::WorkerError;
use crate::headers::{Arguments, X_DEAD_LETTER_EXCHANGE, X_DEAD_LETTER_ROUTING_KEY, X_MESSAGE_TTL};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::ExchangeKind;

pub const TOPIC_POSTFIX: &str = ".topic";
pub const WAIT_POSTFIX: &str = ".wait";
pub const RETRY_POSTFIX: &str = ".retry";
pub const FAIL_POSTFIX: &str = ".fail";

/// Every name derived from a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Names {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub topic_exchange: String,
    pub wait_queue: String,
    pub retry_queue: String,
    pub fail_queue: String,
    pub wait_key: String,
    pub retry_key: String,
    pub fail_key: String,
}

impl Names {
    pub fn new(config: &Config) -> Self {
        let queue = &config.queue_name;
        let exchange = &config.exchange;
        let key = &config.routing_key;
        Self {
            topic_exchange: format!("{exchange}{TOPIC_POSTFIX}"),
            wait_queue: format!("{queue}{WAIT_POSTFIX}"),
            retry_queue: format!("{queue}{RETRY_POSTFIX}"),
            fail_queue: format!("{queue}{FAIL_POSTFIX}"),
            wait_key: format!("{key}{WAIT_POSTFIX}"),
            retry_key: format!("{key}{RETRY_POSTFIX}"),
            fail_key: format!("{key}{FAIL_POSTFIX}"),
            queue: queue.clone(),
            exchange: exchange.clone(),
            routing_key: key.clone(),
        }
    }
}

/// Which derived topology a pool needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Simple,
    /// `ttl` is how long, in seconds, a rejected message waits in `<queue>.retry`.
    Retry { ttl: u32 },
    Repeat,
}

/// Declares the topology for `layout` on a short-lived channel.
///
/// Declarations are idempotent, so every pool start runs this again. On
/// failure nothing already declared is removed.
pub async fn declare(
    connection: &dyn BrokerConnection,
    config: &Config,
    layout: Layout,
) -> Result<Names, WorkerError> {
    let names = Names::new(config);
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| WorkerError::topology("open channel", e))?;

    let result = declare_on(channel.as_ref(), config, &names, layout).await;

    if let Err(e) = channel.close().await {
        log::warn!("Failed to close topology channel: {}", e);
    }
    result?;

    log::info!("Topology for queue '{}' is declared ({:?}).", names.queue, layout);
    Ok(names)
}

async fn declare_on(
    channel: &dyn BrokerChannel,
    config: &Config,
    names: &Names,
    layout: Layout,
) -> Result<(), WorkerError> {
    // Merged into a copy; the caller's config keeps its own arguments.
    let mut primary_args = config.queue_options.arguments();
    if let Layout::Retry { .. } = layout {
        insert_str(&mut primary_args, X_DEAD_LETTER_EXCHANGE, &names.topic_exchange);
        insert_str(&mut primary_args, X_DEAD_LETTER_ROUTING_KEY, &names.retry_key);
    }
    channel
        .queue_declare(&names.queue, &config.queue_options, primary_args)
        .await
        .map_err(|e| WorkerError::topology(format!("declare queue '{}'", names.queue), e))?;

    if !names.exchange.is_empty() {
        let options = &config.exchange_options;
        channel
            .exchange_declare(&names.exchange, options.exchange_kind(), options, options.arguments())
            .await
            .map_err(|e| WorkerError::topology(format!("declare exchange '{}'", names.exchange), e))?;
        channel
            .queue_bind(&names.queue, &names.exchange, &names.routing_key)
            .await
            .map_err(|e| WorkerError::topology(format!("bind queue '{}'", names.queue), e))?;
    }

    let derived = match layout {
        Layout::Simple => return Ok(()),
        Layout::Repeat => vec![
            (&names.wait_queue, &names.wait_key, dead_letter_args(names, None)),
            (&names.fail_queue, &names.fail_key, FieldTable::default()),
        ],
        Layout::Retry { ttl } => vec![
            (&names.retry_queue, &names.retry_key, dead_letter_args(names, Some(ttl))),
            (&names.fail_queue, &names.fail_key, FieldTable::default()),
        ],
    };

    channel
        .exchange_declare(
            &names.topic_exchange,
            ExchangeKind::Topic,
            &config.exchange_options,
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::topology(format!("declare exchange '{}'", names.topic_exchange), e))?;

    // durability flags follow the primary queue; configured args do not
    let derived_options = QueueOptions {
        args: Arguments::new(),
        ..config.queue_options.clone()
    };
    for (queue, _, args) in &derived {
        channel
            .queue_declare(queue, &derived_options, args.clone())
            .await
            .map_err(|e| WorkerError::topology(format!("declare queue '{}'", queue), e))?;
    }
    for (queue, key, _) in &derived {
        channel
            .queue_bind(queue, &names.topic_exchange, key)
            .await
            .map_err(|e| WorkerError::topology(format!("bind queue '{}'", queue), e))?;
    }
    Ok(())
}

/// Arguments sending expired messages back to the primary exchange.
fn dead_letter_args(names: &Names, ttl: Option<u32>) -> FieldTable {
    let mut args = FieldTable::default();
    insert_str(&mut args, X_DEAD_LETTER_EXCHANGE, &names.exchange);
    insert_str(&mut args, X_DEAD_LETTER_ROUTING_KEY, &names.routing_key);
    if let Some(ttl) = ttl {
        args.insert(ShortString::from(X_MESSAGE_TTL), AMQPValue::LongInt(ttl_millis(ttl)));
    }
    args
}

/// Seconds to the 32-bit millisecond value `x-message-ttl` takes.
pub(crate) fn ttl_millis(ttl: u32) -> i32 {
    i32::try_from(u64::from(ttl) * 1000).unwrap_or(i32::MAX)
}

fn insert_str(table: &mut FieldTable, key: &str, value: &str) {
    table.insert(ShortString::from(key), AMQPValue::LongString(value.into()));
}
