//! # RabbitMQ Worker Pool
//! Pools of RabbitMQ consumers sharing one connection, with at-least-once
//! delivery and dead-letter based retry and repeat policies.

pub mod broker;
pub mod config;
pub mod error;
pub mod handler;
pub mod headers;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod publisher;
pub mod rejector;
pub mod repeat;
pub mod retry;
pub mod topology;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export key components for easy access
pub use broker::{AmqpBroker, Broker, BrokerChannel, BrokerConnection, Delivery, MemoryBroker};
pub use config::Config;
pub use error::{BrokerError, WorkerError};
pub use handler::{ErrorHandler, Handler, HandlerContext, HandlerError, JsonHandler, MessageHandler};
pub use logging::{init_logging, Logger};
pub use metrics::WorkerMetrics;
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use publisher::{publish_message, publish_text, Publisher};
pub use rejector::{EmptyRejector, Rejector};
pub use repeat::{RepeatPolicy, RepeatableRejector};
pub use retry::{RetryPolicy, RetryRejector};
pub use topology::Names;
pub use worker::{Worker, WorkerState};
