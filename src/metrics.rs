//! Prometheus counters for message throughput.
//!
//! Counters are created per pool and injected; nothing is registered
//! globally. Register them on the application's registry to expose them.

use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

const SUBSYSTEM: &str = "rmqx_worker";
const DEFAULT_NAMESPACE: &str = "que_system";
const DEFAULT_APP: &str = "worker";

/// Received / handled / rejected message counters shared by a pool's workers.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Every delivery pulled from the queue.
    pub received: IntCounter,
    /// Deliveries handled and acknowledged.
    pub handled: IntCounter,
    /// Deliveries whose handler failed and went to the rejector.
    pub rejected: IntCounter,
}

impl WorkerMetrics {
    /// Counters that are not registered anywhere.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::build(DEFAULT_NAMESPACE, DEFAULT_APP)
    }

    /// Creates the counters and registers them as
    /// `<namespace>_rmqx_worker_<app>_rmq_messages_{handled,received,rejected}_total`.
    /// Dashes in either part become underscores.
    pub fn register(registry: &Registry, namespace: &str, app: &str) -> Result<Self, prometheus::Error> {
        let metrics = Self::build(namespace, app)?;
        registry.register(Box::new(metrics.handled.clone()))?;
        registry.register(Box::new(metrics.received.clone()))?;
        registry.register(Box::new(metrics.rejected.clone()))?;
        Ok(metrics)
    }

    /// Like [`register`](Self::register), taking the namespace from
    /// `NAMESPACE` and the app name from `WORKER`.
    pub fn register_from_env(registry: &Registry) -> Result<Self, prometheus::Error> {
        let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let app = std::env::var("WORKER").unwrap_or_else(|_| DEFAULT_APP.to_string());
        Self::register(registry, &namespace, &app)
    }

    fn build(namespace: &str, app: &str) -> Result<Self, prometheus::Error> {
        let namespace = namespace.replace('-', "_");
        let app = app.replace('-', "_");
        let counter = |what: &str, help: &str| {
            IntCounter::with_opts(
                Opts::new(format!("{app}_rmq_messages_{what}_total"), help)
                    .namespace(namespace.clone())
                    .subsystem(SUBSYSTEM),
            )
        };
        Ok(Self {
            handled: counter("handled", "Number of done handled messages")?,
            received: counter("received", "Number of messages received")?,
            rejected: counter("rejected", "Number of messages rejected")?,
        })
    }
}

/// Renders everything in `registry` in the Prometheus text format.
pub fn encode(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_names() {
        let registry = Registry::new();
        let metrics = WorkerMetrics::register(&registry, "que-system", "mail-sender").unwrap();
        metrics.received.inc();
        metrics.received.inc();
        metrics.handled.inc();

        let text = encode(&registry).unwrap();
        assert!(text.contains("que_system_rmqx_worker_mail_sender_rmq_messages_received_total 2"));
        assert!(text.contains("que_system_rmqx_worker_mail_sender_rmq_messages_handled_total 1"));
        assert!(text.contains("que_system_rmqx_worker_mail_sender_rmq_messages_rejected_total 0"));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = Registry::new();
        WorkerMetrics::register(&registry, "ns", "app").unwrap();
        assert!(WorkerMetrics::register(&registry, "ns", "app").is_err());
    }

    #[test]
    fn unregistered_counters_still_count() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.rejected.inc();
        assert_eq!(metrics.rejected.get(), 1);
    }
}
