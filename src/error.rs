use thiserror::Error;

/// Boxed error type carried by handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by the broker client layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The connection is closed and can no longer be used.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The channel is closed and can no longer be used.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A referenced exchange or queue does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Redeclaring an entity with different properties.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The delivery was already acked, rejected or nacked.
    #[error("delivery already acknowledged")]
    AlreadyAcknowledged,

    /// The broker refused a publish.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Error type for pool construction and worker runtime failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid pool construction arguments or configuration values.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Failed to read a configuration file.
    #[error("failed to read config file: {0}")]
    ConfigFile(#[from] std::io::Error),

    /// Failed to parse a YAML configuration.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dial or channel-open failure.
    #[error("failed to connect to broker: {0}")]
    Connection(#[source] BrokerError),

    /// Declare or bind failure during topology setup.
    #[error("topology setup failed at {step}: {source}")]
    Topology {
        step: String,
        #[source]
        source: BrokerError,
    },

    /// A handler reported a systemic failure.
    #[error("worker fatal error: {0}")]
    Fatal(#[source] BoxError),

    /// A rejection policy could not reroute a failed message.
    #[error("failed to reject message: {0}")]
    Reject(#[source] BrokerError),

    /// Acknowledging a handled message failed.
    #[error("failed to ack message: {0}")]
    Ack(#[source] BrokerError),

    /// The consumer could not be registered or its stream failed.
    #[error("consumer error: {0}")]
    Consume(#[source] BrokerError),

    /// The broker closed the shared connection.
    #[error("Connection closed. {reason}")]
    ConnectionClosed { reason: String },

    /// The broker closed the worker's channel.
    #[error("Channel closed. {reason}")]
    ChannelClosed { reason: String },

    /// Publishing a message failed.
    #[error("failed to publish message: {0}")]
    Publish(#[source] BrokerError),
}

impl WorkerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        WorkerError::Config { message: message.into() }
    }

    pub(crate) fn topology(step: impl Into<String>, source: BrokerError) -> Self {
        WorkerError::Topology { step: step.into(), source }
    }

    /// Whether the error terminates a running worker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Fatal(_)
                | WorkerError::Reject(_)
                | WorkerError::Ack(_)
                | WorkerError::Consume(_)
                | WorkerError::ConnectionClosed { .. }
                | WorkerError::ChannelClosed { .. }
        )
    }
}

// Allow converting from a string-like type into a configuration error
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::config(s)
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::config(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_are_fatal() {
        assert!(WorkerError::ChannelClosed { reason: "gone".into() }.is_fatal());
        assert!(WorkerError::Reject(BrokerError::Publish("nack".into())).is_fatal());
        assert!(!WorkerError::from("worker count must be greater than 0").is_fatal());
        assert!(!WorkerError::Connection(BrokerError::ConnectionClosed("refused".into())).is_fatal());
    }

    #[test]
    fn closed_errors_carry_reason() {
        let err = WorkerError::ConnectionClosed { reason: "broker shutdown".into() };
        assert_eq!(err.to_string(), "Connection closed. broker shutdown");
    }
}
