//! Router: the `RouteSink` every consumer hands messages to, and the owner
//! of the live set of pools, consumers, and the in-flight tracker.
//!
//! Tracker release is implemented once, centrally, by wrapping the broker's
//! callback before it reaches a pool: whichever ack/nack eventually fires —
//! success, config error, rate-limit nack, batch-failure nack, duplicate
//! nack — removes the pipeline key from the tracker as a side effect of that
//! single call. No call site has to remember to call `tracker.remove`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rc_common::{RouterConfig, Warning, WarningCategory, WarningSeverity};
use rc_queue::{MessageCallback, QueueConsumer, QueueMetrics, RouteSink};
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::mediator::{HttpMediator, Mediator};
use crate::pool::MessagePool;
use crate::tracker::{InFlightTracker, TrackOutcome};
use crate::warning::WarningService;

const MAX_POOLS: usize = 200;
const POOL_WARNING_THRESHOLD: usize = 180;

struct TrackingCallback {
    inner: Arc<dyn MessageCallback>,
    tracker: Arc<InFlightTracker>,
    pipeline_key: String,
}

#[async_trait]
impl MessageCallback for TrackingCallback {
    async fn ack(&self) {
        self.inner.ack().await;
        self.tracker.remove(&self.pipeline_key);
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        self.inner.nack(delay_seconds).await;
        self.tracker.remove(&self.pipeline_key);
    }
}

pub struct Router {
    pools: DashMap<String, Arc<MessagePool>>,
    consumers: DashMap<String, Arc<dyn QueueConsumer>>,
    tracker: Arc<InFlightTracker>,
    breakers: Arc<CircuitBreakerRegistry>,
    mediator: Arc<dyn Mediator>,
    warnings: Arc<WarningService>,
}

impl Router {
    pub fn new(warnings: Arc<WarningService>) -> reqwest::Result<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let mediator: Arc<dyn Mediator> = Arc::new(HttpMediator::new(breakers.clone())?);
        Ok(Self {
            pools: DashMap::new(),
            consumers: DashMap::new(),
            tracker: Arc::new(InFlightTracker::new()),
            breakers,
            mediator,
            warnings,
        })
    }

    #[cfg(test)]
    fn with_mediator(warnings: Arc<WarningService>, mediator: Arc<dyn Mediator>) -> Self {
        Self {
            pools: DashMap::new(),
            consumers: DashMap::new(),
            tracker: Arc::new(InFlightTracker::new()),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            mediator,
            warnings,
        }
    }

    pub fn tracker(&self) -> &InFlightTracker {
        &self.tracker
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn queue_ids(&self) -> Vec<String> {
        self.consumers.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn queue_metrics(&self) -> Vec<QueueMetrics> {
        let consumers: Vec<Arc<dyn QueueConsumer>> =
            self.consumers.iter().map(|entry| entry.value().clone()).collect();
        let mut out = Vec::new();
        for consumer in consumers {
            if let Ok(Some(m)) = consumer.metrics().await {
                out.push(m);
            }
        }
        out
    }

    /// Reconcile the live set of pools and consumers against a freshly
    /// fetched configuration. Idempotent: running it twice with the same
    /// config is a no-op on the second run.
    pub async fn reconcile(self: &Arc<Self>, config: &RouterConfig) {
        if config.pools.len() > MAX_POOLS {
            error!(requested = config.pools.len(), max = MAX_POOLS, "configuration requests more pools than the configured maximum, refusing to reconcile");
            self.warnings.add(Warning::new(
                WarningCategory::Configuration,
                WarningSeverity::Critical,
                format!("refused a config with {} pools, exceeding the maximum of {MAX_POOLS}", config.pools.len()),
                "Router",
            ));
            return;
        }
        if config.pools.len() > POOL_WARNING_THRESHOLD {
            self.warnings.add(Warning::new(
                WarningCategory::Configuration,
                WarningSeverity::Warning,
                format!("pool count ({}) is approaching the configured maximum of {MAX_POOLS}", config.pools.len()),
                "Router",
            ));
        }

        let wanted_pools: std::collections::HashSet<&str> = config.pools.iter().map(|p| p.code.as_str()).collect();

        for pool_config in &config.pools {
            match self.pools.get(&pool_config.code) {
                Some(existing) => {
                    existing.update_concurrency(pool_config.concurrency);
                    existing.update_rate_limit(pool_config.rate_limit_per_minute);
                    existing.update_max_queue_depth(pool_config.max_queue_depth);
                }
                None => {
                    info!(pool = %pool_config.code, "creating pool");
                    let pool = Arc::new(MessagePool::new(pool_config, self.mediator.clone()));
                    self.pools.insert(pool_config.code.clone(), pool);
                }
            }
        }

        let stale_pools: Vec<String> = self.pools.iter().map(|e| e.key().clone()).filter(|code| !wanted_pools.contains(code.as_str())).collect();
        for code in stale_pools {
            if let Some((_, pool)) = self.pools.remove(&code) {
                info!(pool = %code, "draining and removing pool no longer in configuration");
                pool.drain();
                self.breakers.remove(&code);
            }
        }

        let wanted_queues: std::collections::HashSet<&str> = config.queues.iter().map(|q| q.queue_id.as_str()).collect();
        let stale_queues: Vec<String> = self.consumers.iter().map(|e| e.key().clone()).filter(|id| !wanted_queues.contains(id.as_str())).collect();
        for queue_id in stale_queues {
            if let Some((_, consumer)) = self.consumers.remove(&queue_id) {
                info!(queue = %queue_id, "stopping consumer no longer in configuration");
                consumer.stop().await;
            }
        }
    }

    /// Register and start a consumer built by the caller (which knows how to
    /// construct the broker-specific client for `queue_mapping.kind`). Not
    /// created here so `rc-router` never needs broker SDK credentials beyond
    /// what the caller already resolved.
    pub async fn register_consumer(self: &Arc<Self>, consumer: Arc<dyn QueueConsumer>) {
        let queue_id = consumer.queue_identifier().to_string();
        consumer.clone().start(self.clone() as Arc<dyn RouteSink>).await;
        self.consumers.insert(queue_id, consumer);
    }

    pub async fn drain_all(&self, grace_period: std::time::Duration) {
        for entry in self.pools.iter() {
            entry.value().drain();
        }
        for entry in self.consumers.iter() {
            entry.value().stop().await;
        }
        tokio::time::sleep(grace_period).await;
    }

    /// Scan the tracker for entries older than `warn_threshold_seconds` and
    /// raise a warning for each. Entries older than `force_release_seconds`
    /// are additionally nacked so the upstream broker can redeliver them,
    /// rather than leaving them stuck in the tracker forever. Pure
    /// observability: it never changes ordering or admission semantics.
    pub async fn detect_stalled_messages(&self, warn_threshold_seconds: u64, force_release_seconds: Option<u64>) {
        let stalled = self.tracker.stalled(warn_threshold_seconds);
        if stalled.is_empty() {
            return;
        }

        for entry in &stalled {
            warn!(
                pipeline_key = %entry.pipeline_key,
                pool_code = %entry.pool_code,
                source_queue_id = %entry.source_queue_id,
                elapsed_seconds = entry.elapsed_seconds,
                "message has been in flight longer than the stall threshold"
            );
        }

        self.warnings.add(Warning::new(
            WarningCategory::PoolHealth,
            WarningSeverity::Warning,
            format!("{} message(s) exceeded the stall threshold of {warn_threshold_seconds}s", stalled.len()),
            "Router",
        ));

        let Some(force_release_seconds) = force_release_seconds else { return };
        for entry in stalled.into_iter().filter(|e| e.elapsed_seconds >= force_release_seconds) {
            if let Some(callback) = self.tracker.callback_for(&entry.pipeline_key) {
                error!(pipeline_key = %entry.pipeline_key, "force-releasing message that exceeded the hard stall threshold");
                callback.nack(None).await;
                self.tracker.remove(&entry.pipeline_key);
            }
        }
    }

    /// Extend the upstream visibility timeout for every message that has
    /// been in flight longer than `threshold_seconds`, so a slow downstream
    /// call is not raced by the broker's own redelivery.
    pub async fn extend_visibility_for_long_running(&self, threshold_seconds: u64, extension_seconds: u32) {
        for entry in self.tracker.stalled(threshold_seconds) {
            if let Some(callback) = self.tracker.callback_for(&entry.pipeline_key) {
                debug_extend(&entry.pipeline_key, entry.elapsed_seconds, extension_seconds);
                callback.extend_visibility(extension_seconds).await;
            }
        }
    }
}

fn debug_extend(pipeline_key: &str, elapsed_seconds: u64, extension_seconds: u32) {
    tracing::debug!(pipeline_key, elapsed_seconds, extension_seconds, "extending visibility for long-running message");
}

#[async_trait]
impl RouteSink for Router {
    async fn route(&self, pointer: rc_common::MessagePointer, callback: Arc<dyn MessageCallback>, queue_id: &str) {
        let pool_code = pointer.pool_code.clone();
        let message_id = pointer.id.clone();

        let outcome = self.tracker.track(pointer.clone(), callback.clone(), queue_id.to_string());

        let pipeline_key = match outcome {
            TrackOutcome::Duplicate { is_requeue, .. } => {
                if is_requeue {
                    info!(message = %message_id, "requeue duplicate, nacking to let the external requeue settle");
                } else {
                    info!(message = %message_id, "duplicate redelivery, nacking to let the in-flight attempt finish");
                }
                callback.nack(Some(30)).await;
                return;
            }
            TrackOutcome::Tracked { pipeline_key } => pipeline_key,
        };

        let tracked_callback: Arc<dyn MessageCallback> =
            Arc::new(TrackingCallback { inner: callback, tracker: self.tracker.clone(), pipeline_key });

        let Some(pool) = self.pools.get(&pool_code).map(|e| e.value().clone()) else {
            error!(pool = %pool_code, message = %message_id, "no pool configured for this poolCode, acking to avoid a redelivery loop");
            self.warnings.add(Warning::new(
                WarningCategory::Routing,
                WarningSeverity::Error,
                format!("message for unknown pool code '{pool_code}' was acked and dropped"),
                "Router",
            ));
            tracked_callback.ack().await;
            return;
        };

        pool.submit(pointer, tracked_callback).await;
    }
}
