//! MessagePool: per-pool FIFO ordering, concurrency limiting, and rate limiting.
//!
//! Ordering is enforced with a dedicated worker task per message group rather
//! than an explicit pending-list structure: each group gets its own bounded
//! channel and a single task drains it serially, so two messages in the same
//! group can never mediate concurrently while different groups run in
//! parallel up to the pool's concurrency limit.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use rc_common::{MediationResult, MessagePointer, PoolConfig};
use rc_queue::MessageCallback;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::mediator::Mediator;
use crate::rate_limiter::RateLimiter;

const DEFAULT_GROUP: &str = "__default__";
const GROUP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const GROUP_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    pub batch_id: Arc<str>,
    pub group_id: Arc<str>,
}

impl BatchGroupKey {
    fn new(batch_id: &str, group_id: &str) -> Self {
        Self { batch_id: Arc::from(batch_id), group_id: Arc::from(group_id) }
    }
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.group_id)
    }
}

struct PoolTask {
    pointer: MessagePointer,
    callback: Arc<dyn MessageCallback>,
    batch_group_key: Option<BatchGroupKey>,
}

pub struct MessagePool {
    code: Arc<str>,
    concurrency: AtomicU32,
    max_queue_depth: AtomicU32,
    semaphore: Arc<Semaphore>,
    mediator: Arc<dyn Mediator>,
    rate_limiter: Arc<RateLimiter>,

    message_group_queues: DashMap<Arc<str>, mpsc::Sender<PoolTask>>,
    active_group_threads: DashSet<Arc<str>>,
    failed_batch_groups: Arc<DashSet<BatchGroupKey>>,
    batch_group_message_count: Arc<DashMap<BatchGroupKey, AtomicU32>>,

    running: AtomicBool,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
}

impl MessagePool {
    pub fn new(config: &PoolConfig, mediator: Arc<dyn Mediator>) -> Self {
        Self {
            code: Arc::from(config.code.as_str()),
            concurrency: AtomicU32::new(config.concurrency),
            max_queue_depth: AtomicU32::new(config.max_queue_depth),
            semaphore: Arc::new(Semaphore::new(config.concurrency as usize)),
            mediator,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            message_group_queues: DashMap::new(),
            active_group_threads: DashSet::new(),
            failed_batch_groups: Arc::new(DashSet::new()),
            batch_group_message_count: Arc::new(DashMap::new()),
            running: AtomicBool::new(true),
            queue_size: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    fn capacity(&self) -> u32 {
        self.max_queue_depth.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0 && self.active_workers.load(Ordering::SeqCst) == 0
    }

    /// Admit a message into its group's FIFO queue, or nack it immediately if
    /// the pool is draining, at capacity, or the message's batch+group has
    /// already failed.
    pub async fn submit(&self, pointer: MessagePointer, callback: Arc<dyn MessageCallback>) {
        if !self.running.load(Ordering::SeqCst) {
            callback.nack(Some(5)).await;
            return;
        }

        if self.queue_size.load(Ordering::SeqCst) >= self.capacity() {
            debug!(pool = %self.code, "pool at capacity, nacking for backpressure");
            callback.nack(Some(10)).await;
            return;
        }

        let group_id: Arc<str> = pointer
            .message_group_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from(DEFAULT_GROUP));

        let batch_group_key = pointer.batch_id.as_deref().map(|batch_id| BatchGroupKey::new(batch_id, &group_id));

        if let Some(ref key) = batch_group_key {
            self.batch_group_message_count.entry(key.clone()).or_insert_with(|| AtomicU32::new(0)).fetch_add(1, Ordering::SeqCst);

            if self.failed_batch_groups.contains(key) {
                debug!(pool = %self.code, batch_group = %key, "batch+group already failed, nacking to preserve fifo order");
                decrement_and_cleanup(key, &self.batch_group_message_count, &self.failed_batch_groups);
                callback.nack(Some(0)).await;
                return;
            }
        }

        self.queue_size.fetch_add(1, Ordering::SeqCst);

        let task = PoolTask { pointer, callback, batch_group_key };
        let group_tx = self.get_or_create_group_worker(&group_id);

        if let Err(mpsc::error::SendError(task)) = group_tx.send(task).await {
            // Worker exited between the liveness check and the send. Remove
            // the stale sender and retry once with a freshly spawned worker.
            self.message_group_queues.remove(&group_id);
            let retry_tx = self.get_or_create_group_worker(&group_id);
            if retry_tx.send(task).await.is_err() {
                error!(pool = %self.code, group_id = %group_id, "failed to hand message to group worker after retry");
                self.queue_size.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn get_or_create_group_worker(&self, group_id: &Arc<str>) -> mpsc::Sender<PoolTask> {
        if let Some(tx) = self.message_group_queues.get(group_id) {
            if self.active_group_threads.contains(group_id) {
                return tx.clone();
            }
        }

        self.message_group_queues.remove(group_id);

        let (tx, rx) = mpsc::channel(GROUP_CHANNEL_CAPACITY);
        self.message_group_queues.insert(group_id.clone(), tx.clone());
        self.active_group_threads.insert(group_id.clone());
        self.spawn_group_worker(group_id.clone(), rx);
        tx
    }

    fn spawn_group_worker(&self, group_id: Arc<str>, rx: mpsc::Receiver<PoolTask>) {
        let pool_code = self.code.clone();
        let semaphore = self.semaphore.clone();
        let mediator = self.mediator.clone();
        let rate_limiter = self.rate_limiter.clone();
        let queue_size = self.queue_size.clone();
        let active_workers = self.active_workers.clone();
        let failed_batch_groups = self.failed_batch_groups.clone();
        let batch_group_message_count = self.batch_group_message_count.clone();
        let message_group_queues_entry = self.message_group_queues.clone();
        let active_group_threads = self.active_group_threads.clone();

        tokio::spawn(async move {
            run_group_worker(
                group_id.clone(),
                pool_code,
                rx,
                semaphore,
                mediator,
                rate_limiter,
                queue_size,
                active_workers,
                failed_batch_groups,
                batch_group_message_count,
                message_group_queues_entry,
            )
            .await;
            active_group_threads.remove(&group_id);
        });
    }

    pub fn drain(&self) {
        info!(pool = %self.code, "draining pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn update_concurrency(&self, new_concurrency: u32) {
        if new_concurrency == 0 {
            warn!(pool = %self.code, "rejecting concurrency update to zero");
            return;
        }
        let old = self.concurrency.swap(new_concurrency, Ordering::SeqCst);
        let diff = new_concurrency as i64 - old as i64;
        if diff > 0 {
            self.semaphore.add_permits(diff as usize);
        }
        // A decrease is applied lazily: permits simply aren't replenished as
        // in-flight work releases them, until the semaphore count converges.
    }

    pub fn update_rate_limit(&self, new_rate: Option<u32>) {
        self.rate_limiter.reconfigure(new_rate);
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        self.rate_limiter.rate_per_minute()
    }

    pub fn update_max_queue_depth(&self, new_max_queue_depth: u32) {
        self.max_queue_depth.store(new_max_queue_depth, Ordering::SeqCst);
    }

    pub fn max_queue_depth(&self) -> u32 {
        self.max_queue_depth.load(Ordering::SeqCst)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_group_worker(
    group_id: Arc<str>,
    pool_code: Arc<str>,
    mut rx: mpsc::Receiver<PoolTask>,
    semaphore: Arc<Semaphore>,
    mediator: Arc<dyn Mediator>,
    rate_limiter: Arc<RateLimiter>,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
    failed_batch_groups: Arc<DashSet<BatchGroupKey>>,
    batch_group_message_count: Arc<DashMap<BatchGroupKey, AtomicU32>>,
    message_group_queues: DashMap<Arc<str>, mpsc::Sender<PoolTask>>,
) {
    debug!(group_id = %group_id, pool = %pool_code, "group worker started");

    loop {
        let task = match tokio::time::timeout(GROUP_IDLE_TIMEOUT, rx.recv()).await {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(_) => {
                if rx.is_empty() {
                    message_group_queues.remove(&group_id);
                    break;
                }
                continue;
            }
        };

        queue_size.fetch_sub(1, Ordering::SeqCst);

        if let Some(ref key) = task.batch_group_key {
            if failed_batch_groups.contains(key) {
                warn!(pool = %pool_code, batch_group = %key, "message from failed batch+group, nacking to preserve fifo order");
                decrement_and_cleanup(key, &batch_group_message_count, &failed_batch_groups);
                task.callback.nack(Some(0)).await;
                continue;
            }
        }

        while !rate_limiter.try_acquire() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!(pool = %pool_code, "semaphore closed, dropping message");
                if let Some(ref key) = task.batch_group_key {
                    decrement_and_cleanup(key, &batch_group_message_count, &failed_batch_groups);
                }
                task.callback.nack(Some(5)).await;
                break;
            }
        };

        active_workers.fetch_add(1, Ordering::SeqCst);
        let outcome = mediator.mediate(&task.pointer).await;

        match &outcome {
            MediationResult::Success => {
                task.callback.ack().await;
            }
            MediationResult::ConfigError { reason } => {
                warn!(pool = %pool_code, message = %task.pointer.id, reason, "configuration error, acking to prevent a retry storm");
                task.callback.ack().await;
            }
            MediationResult::Nack { delay_seconds, reason } => {
                warn!(pool = %pool_code, message = %task.pointer.id, reason, "nacking for retry");
                if let Some(ref key) = task.batch_group_key {
                    if failed_batch_groups.insert(key.clone()) {
                        warn!(pool = %pool_code, batch_group = %key, "batch+group marked failed, remaining members will fast-fail");
                    }
                }
                task.callback.nack(Some(*delay_seconds)).await;
            }
        }

        if let Some(ref key) = task.batch_group_key {
            decrement_and_cleanup(key, &batch_group_message_count, &failed_batch_groups);
        }

        active_workers.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    }

    debug!(group_id = %group_id, pool = %pool_code, "group worker exited");
}

fn decrement_and_cleanup(
    key: &BatchGroupKey,
    batch_group_message_count: &DashMap<BatchGroupKey, AtomicU32>,
    failed_batch_groups: &DashSet<BatchGroupKey>,
) {
    let should_cleanup = if let Some(counter) = batch_group_message_count.get(key) {
        counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1) == 0
    } else {
        false
    };

    if should_cleanup {
        batch_group_message_count.remove(key);
        failed_batch_groups.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rc_common::MediationType;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingCallback {
        acked: Arc<AtomicUsize>,
        nacked: Arc<AtomicUsize>,
        order: Arc<AsyncMutex<Vec<String>>>,
        id: String,
    }

    #[async_trait]
    impl MessageCallback for RecordingCallback {
        async fn ack(&self) {
            self.acked.fetch_add(1, Ordering::SeqCst);
            self.order.lock().await.push(self.id.clone());
        }
        async fn nack(&self, _delay_seconds: Option<u32>) {
            self.nacked.fetch_add(1, Ordering::SeqCst);
            self.order.lock().await.push(format!("nack:{}", self.id));
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl Mediator for AlwaysSucceeds {
        async fn mediate(&self, _pointer: &MessagePointer) -> MediationResult {
            MediationResult::Success
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Mediator for AlwaysFails {
        async fn mediate(&self, _pointer: &MessagePointer) -> MediationResult {
            MediationResult::Nack { delay_seconds: 1, reason: "boom".to_string() }
        }
    }

    fn pointer(id: &str, group: Option<&str>, batch: Option<&str>) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            broker_message_id: None,
            pool_code: "pool-a".to_string(),
            auth_token: "t".to_string(),
            mediation_type: MediationType::HTTP,
            mediation_target: "https://example.test".to_string(),
            message_group_id: group.map(|s| s.to_string()),
            batch_id: batch.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn same_group_messages_process_in_order() {
        let config = PoolConfig { code: "pool-a".into(), concurrency: 4, rate_limit_per_minute: None, max_queue_depth: 200 };
        let pool = MessagePool::new(&config, Arc::new(AlwaysSucceeds));

        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let acked = Arc::new(AtomicUsize::new(0));
        let nacked = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let cb = Arc::new(RecordingCallback {
                acked: acked.clone(),
                nacked: nacked.clone(),
                order: order.clone(),
                id: format!("m{i}"),
            });
            pool.submit(pointer(&format!("m{i}"), Some("group-1"), None), cb).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(acked.load(Ordering::SeqCst), 5);
        let seen = order.lock().await.clone();
        assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn batch_failure_fast_fails_remaining_group_members() {
        let config = PoolConfig { code: "pool-a".into(), concurrency: 2, rate_limit_per_minute: None, max_queue_depth: 200 };
        let pool = MessagePool::new(&config, Arc::new(AlwaysFails));

        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let acked = Arc::new(AtomicUsize::new(0));
        let nacked = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let cb = Arc::new(RecordingCallback {
                acked: acked.clone(),
                nacked: nacked.clone(),
                order: order.clone(),
                id: format!("m{i}"),
            });
            pool.submit(pointer(&format!("m{i}"), Some("group-1"), Some("batch-1")), cb).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(acked.load(Ordering::SeqCst), 0);
        assert_eq!(nacked.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn different_groups_do_not_block_each_other() {
        let config = PoolConfig { code: "pool-a".into(), concurrency: 4, rate_limit_per_minute: None, max_queue_depth: 200 };
        let pool = MessagePool::new(&config, Arc::new(AlwaysSucceeds));

        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let acked = Arc::new(AtomicUsize::new(0));
        let nacked = Arc::new(AtomicUsize::new(0));

        for (i, group) in [("a", "group-a"), ("b", "group-b")] {
            let cb = Arc::new(RecordingCallback { acked: acked.clone(), nacked: nacked.clone(), order: order.clone(), id: i.to_string() });
            pool.submit(pointer(i, Some(group), None), cb).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(acked.load(Ordering::SeqCst), 2);
    }

    struct SlowMediator;

    #[async_trait]
    impl Mediator for SlowMediator {
        async fn mediate(&self, _pointer: &MessagePointer) -> MediationResult {
            tokio::time::sleep(Duration::from_millis(300)).await;
            MediationResult::Success
        }
    }

    #[tokio::test]
    async fn backpressure_uses_configured_max_queue_depth_not_concurrency() {
        // Concurrency is generous (5); maxQueueDepth is the binding constraint (1).
        let config = PoolConfig { code: "pool-a".into(), concurrency: 5, rate_limit_per_minute: None, max_queue_depth: 1 };
        let pool = MessagePool::new(&config, Arc::new(SlowMediator));

        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let acked = Arc::new(AtomicUsize::new(0));
        let nacked = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let cb = Arc::new(RecordingCallback { acked: acked.clone(), nacked: nacked.clone(), order: order.clone(), id: format!("m{i}") });
            pool.submit(pointer(&format!("m{i}"), Some("group-1"), None), cb).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(nacked.load(Ordering::SeqCst), 1, "the third submit should be rejected once the queue hits maxQueueDepth");
    }
}
