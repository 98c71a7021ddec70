//! Wires the Poller (C5), Key-Sequencer (C6), and Dispatch Pipeline (C8)
//! together into a single runnable `Dispatcher`.
//!
//! Nothing here is a singleton: a `Dispatcher` is an explicit value built
//! by `DispatcherBuilder` and handed an `Arc` of itself around, rather
//! than reached for through a global.

pub mod pipeline;
pub mod poller;
pub mod sequencer;

use std::sync::Arc;

use obx_coordinator::OwnedPartitions;
use obx_handlers::HandlerRegistry;
use obx_retry::{DefaultErrorClassifier, ErrorClassifier, RetryPolicy};
use obx_routing::RoutingTable;
use sqlx::PgPool;

pub use pipeline::{Pipeline, Transition};
pub use sequencer::Sequencer;

pub struct DispatcherConfig {
    pub instance_id: String,
    pub worker_concurrency: usize,
    pub poller: poller::PollerConfig,
    pub delete_on_complete: bool,
    pub stop_on_first_failure: bool,
}

pub struct DispatcherBuilder {
    pool: PgPool,
    handlers: HandlerRegistry,
    routing: RoutingTable,
    default_retry_policy: RetryPolicy,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    /// The builder defaults to [`DefaultErrorClassifier`] rather than no
    /// classifier at all, so a configured `retry.includeExceptions`/
    /// `excludeExceptions` has a chance to take effect out of the box.
    /// Call `.with_classifier(...)` to replace it with something that
    /// understands the handlers' own error types.
    pub fn new(pool: PgPool, config: DispatcherConfig, default_retry_policy: RetryPolicy) -> Self {
        DispatcherBuilder {
            pool,
            handlers: HandlerRegistry::new(),
            routing: RoutingTable::new(Vec::new()),
            default_retry_policy,
            classifier: Some(Arc::new(DefaultErrorClassifier)),
            config,
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_routing(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> Dispatcher {
        let pipeline = Arc::new(Pipeline {
            pool: self.pool.clone(),
            handlers: Arc::new(self.handlers),
            routing: Arc::new(self.routing),
            default_retry_policy: self.default_retry_policy,
            classifier: self.classifier,
            delete_on_complete: self.config.delete_on_complete,
        });

        Dispatcher { pool: self.pool, pipeline, config: self.config }
    }
}

pub struct Dispatcher {
    pool: PgPool,
    pipeline: Arc<Pipeline>,
    config: DispatcherConfig,
}

pub struct DispatcherHandle {
    poller: tokio::task::JoinHandle<()>,
    pub sequencer: Arc<Sequencer>,
}

impl DispatcherHandle {
    /// Stops the poller from handing out any further keys, then waits up
    /// to `timeout` for whatever per-key work the sequencer already had in
    /// flight to finish, so a shutdown never kills a claim mid-dispatch.
    pub async fn shutdown(self, timeout: std::time::Duration) {
        self.poller.abort();
        self.sequencer.drain(timeout).await;
    }
}

impl Dispatcher {
    /// Starts the poller against `owned_partitions`, the live snapshot
    /// published by the Cluster Coordinator. The dispatcher does not own
    /// the coordinator's tasks — callers run `obx_coordinator::spawn`
    /// separately and pass in its `owned_partitions` handle.
    pub fn spawn(self, owned_partitions: OwnedPartitions) -> DispatcherHandle {
        let sequencer = Sequencer::new(
            self.pool.clone(),
            self.pipeline.clone(),
            self.config.instance_id.clone(),
            self.config.worker_concurrency,
            owned_partitions.clone(),
            self.config.stop_on_first_failure,
        );
        let poller = poller::spawn(self.pool, owned_partitions, sequencer.clone(), self.config.poller);
        DispatcherHandle { poller, sequencer }
    }
}
