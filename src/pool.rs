//! The worker pool and its builder.

use crate::broker::{AmqpBroker, Broker, BrokerConnection};
use crate::config::Config;
use crate::error::WorkerError;
use crate::handler::{ErrorHandler, Handler};
use crate::metrics::WorkerMetrics;
use crate::rejector::{EmptyRejector, Rejector};
use crate::repeat::{RepeatPolicy, RepeatableRejector};
use crate::retry::{RetryPolicy, RetryRejector};
use crate::topology::{self, Layout, Names};
use crate::worker::{Worker, WorkerParts};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A set of workers consuming one queue over one shared connection.
///
/// Use [`WorkerPool::builder`] or one of the `new_*` shortcuts.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    connection: Arc<dyn BrokerConnection>,
    names: Names,
    metrics: WorkerMetrics,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    connection_closed: AtomicBool,
}

impl WorkerPool {
    /// Starts configuring a pool for `config`. Defaults to one worker on an
    /// [`AmqpBroker`](crate::broker::AmqpBroker).
    pub fn builder(config: Config) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(config)
    }

    /// A pool that drops failed messages.
    pub async fn new_simple(
        config: Config,
        workers: usize,
        handler: impl Handler + 'static,
        error_handler: Option<Arc<dyn ErrorHandler>>,
    ) -> Result<Self, WorkerError> {
        Self::builder(config)
            .workers(workers)
            .handler(handler)
            .with_error_handler(error_handler)
            .simple()
            .await
    }

    /// A pool that retries failed messages every `ttl` seconds, `max_retry`
    /// deliveries in total.
    pub async fn new_retry(
        config: Config,
        workers: usize,
        handler: impl Handler + 'static,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        ttl: u32,
        max_retry: u32,
    ) -> Result<Self, WorkerError> {
        Self::builder(config)
            .workers(workers)
            .handler(handler)
            .with_error_handler(error_handler)
            .retry(RetryPolicy::new(ttl, max_retry))
            .await
    }

    /// A pool that repeats failed messages with growing delays.
    pub async fn new_repeat(
        config: Config,
        workers: usize,
        handler: impl Handler + 'static,
        error_handler: Option<Arc<dyn ErrorHandler>>,
        ttl_base: u32,
        ttl_range: u32,
        max_repeat: u32,
    ) -> Result<Self, WorkerError> {
        Self::builder(config)
            .workers(workers)
            .handler(handler)
            .with_error_handler(error_handler)
            .repeat(RepeatPolicy::new(ttl_base, ttl_range, max_repeat))
            .await
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Queue and exchange names declared for this pool.
    pub fn names(&self) -> &Names {
        &self.names
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Runs every worker until `ctx` is cancelled, a worker fails, or all
    /// workers finish. The pool is stopped before this returns.
    ///
    /// Returns the first worker error; later ones are dropped.
    pub async fn start(&self, ctx: CancellationToken) -> Result<(), WorkerError> {
        let (errors_tx, mut errors_rx) = mpsc::channel(self.workers.len().max(1));

        for worker in &self.workers {
            let worker = worker.clone();
            let errors = errors_tx.clone();
            let shutdown = self.shutdown.child_token();
            self.tracker.spawn(async move {
                if let Err(e) = worker.run(shutdown).await {
                    // the channel has a slot per worker
                    let _ = errors.try_send(e);
                }
            });
        }
        drop(errors_tx);

        log::info!(
            "Worker pool started with {} workers on queue '{}'.",
            self.workers.len(),
            self.names.queue
        );

        let result = tokio::select! {
            _ = ctx.cancelled() => {
                log::info!("Shutdown requested, stopping worker pool.");
                Ok(())
            }
            _ = self.shutdown.cancelled() => Ok(()),
            received = errors_rx.recv() => match received {
                Some(e) => {
                    log::error!("Worker pool stopping after fatal error: {}", e);
                    Err(e)
                }
                None => Ok(()),
            },
        };

        if let Err(e) = self.stop().await {
            log::error!("Failed to stop worker pool cleanly: {}", e);
        }
        result
    }

    /// Stops the pool: cancels the workers, closes the shared connection,
    /// closes every worker's channel and waits for the worker tasks.
    ///
    /// Safe to call more than once and from several tasks; only the first
    /// call closes the connection.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.shutdown.cancel();

        let mut result = Ok(());
        if !self.connection_closed.swap(true, Ordering::SeqCst) && !self.connection.is_closed() {
            if let Err(e) = self.connection.close().await {
                log::error!("failed to close connection: {}", e);
                result = Err(WorkerError::Connection(e));
            }
        }

        for worker in &self.workers {
            if let Err(e) = worker.close().await {
                log::warn!("failed to close {}: {}", worker.name(), e);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        result
    }
}

/// Collects what a pool needs; finish with [`simple`](Self::simple),
/// [`retry`](Self::retry) or [`repeat`](Self::repeat).
pub struct WorkerPoolBuilder {
    config: Config,
    workers: usize,
    handler: Option<Arc<dyn Handler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    broker: Option<Arc<dyn Broker>>,
    metrics: Option<WorkerMetrics>,
}

impl WorkerPoolBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            workers: 1,
            handler: None,
            error_handler: None,
            broker: None,
            metrics: None,
        }
    }

    /// Number of workers. Defaults to 1.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Called with every non-fatal handler error, before the message is rejected.
    pub fn error_handler(mut self, error_handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(error_handler));
        self
    }

    fn with_error_handler(mut self, error_handler: Option<Arc<dyn ErrorHandler>>) -> Self {
        self.error_handler = error_handler;
        self
    }

    /// Broker to connect through. Defaults to [`AmqpBroker`].
    pub fn broker(mut self, broker: impl Broker + 'static) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Counters to update. Defaults to unregistered ones.
    pub fn metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Failed messages are rejected without requeue.
    pub async fn simple(self) -> Result<WorkerPool, WorkerError> {
        self.validate(false)?;
        self.build(Layout::Simple, Arc::new(EmptyRejector)).await
    }

    /// Failed messages wait `policy.ttl` seconds in `<queue>.retry`, up to
    /// `policy.max_retry` deliveries, then go to `<queue>.fail`.
    pub async fn retry(self, policy: RetryPolicy) -> Result<WorkerPool, WorkerError> {
        self.validate(true)?;
        if i32::try_from(u64::from(policy.ttl) * 1000).is_err() {
            return Err(WorkerError::config("retry ttl does not fit x-message-ttl"));
        }
        let rejector = RetryRejector::new(policy, &self.config);
        self.build(Layout::Retry { ttl: policy.ttl }, Arc::new(rejector)).await
    }

    /// Failed messages wait in `<queue>.wait` for a growing delay, up to
    /// `policy.max_repeat` times, then go to `<queue>.fail`.
    pub async fn repeat(self, policy: RepeatPolicy) -> Result<WorkerPool, WorkerError> {
        self.validate(true)?;
        let rejector = RepeatableRejector::new(policy, &self.config);
        self.build(Layout::Repeat, Arc::new(rejector)).await
    }

    fn validate(&self, requires_exchange: bool) -> Result<(), WorkerError> {
        if self.workers == 0 {
            return Err(WorkerError::config("worker count must be greater than 0"));
        }
        self.config.validate(requires_exchange)?;
        if self.handler.is_none() {
            return Err(WorkerError::config("handler must be set"));
        }
        Ok(())
    }

    async fn build(self, layout: Layout, rejector: Arc<dyn Rejector>) -> Result<WorkerPool, WorkerError> {
        let handler = self
            .handler
            .ok_or_else(|| WorkerError::config("handler must be set"))?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => WorkerMetrics::new().map_err(|e| WorkerError::config(format!("metrics: {e}")))?,
        };
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(AmqpBroker::new()) as Arc<dyn Broker>);

        let connection = broker
            .connect(&self.config.connection_url)
            .await
            .map_err(WorkerError::Connection)?;

        let names = match topology::declare(connection.as_ref(), &self.config, layout).await {
            Ok(names) => names,
            Err(e) => {
                if let Err(close) = connection.close().await {
                    log::warn!("failed to close connection after topology error: {}", close);
                }
                return Err(e);
            }
        };

        let parts = WorkerParts {
            config: Arc::new(self.config),
            connection: connection.clone(),
            handler,
            error_handler: self.error_handler,
            rejector,
            metrics: metrics.clone(),
        };
        let workers = (0..self.workers)
            .map(|i| Arc::new(Worker::new(format!("worker-{i}"), parts.clone())))
            .collect();

        Ok(WorkerPool {
            workers,
            connection,
            names,
            metrics,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            connection_closed: AtomicBool::new(false),
        })
    }
}
