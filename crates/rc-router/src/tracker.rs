//! InFlightTracker: the process-wide map of pipeline-key to tracked message.
//!
//! Duplicate detection runs on two axes: the pipeline key itself (physical
//! redelivery of the same broker message) and the application id (an
//! external requeue that produced a new broker message for work already in
//! flight). Both the primary map and the applicationId index are mutated
//! under a single writer lock so a concurrent `track` never observes them
//! out of sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use rc_common::MessagePointer;
use rc_queue::MessageCallback;

/// One admitted message, owned by the tracker until `remove` releases it.
#[derive(Clone)]
pub struct TrackedMessage {
    pub pipeline_key: String,
    pub application_id: String,
    pub broker_id: Option<String>,
    pub source_queue_id: String,
    pub pointer: MessagePointer,
    pub callback: Arc<dyn MessageCallback>,
    pub tracked_at: Instant,
}

impl TrackedMessage {
    pub fn elapsed_seconds(&self) -> u64 {
        self.tracked_at.elapsed().as_secs()
    }
}

/// Outcome of a `track` call.
pub enum TrackOutcome {
    Tracked { pipeline_key: String },
    Duplicate { existing_key: String, is_requeue: bool },
}

struct State {
    by_pipeline_key: HashMap<String, TrackedMessage>,
    app_id_to_pipeline_key: HashMap<String, String>,
}

pub struct InFlightTracker {
    state: RwLock<State>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                by_pipeline_key: HashMap::new(),
                app_id_to_pipeline_key: HashMap::new(),
            }),
        }
    }

    /// Admit `pointer` or report it as a duplicate of an in-flight entry.
    pub fn track(
        &self,
        pointer: MessagePointer,
        callback: Arc<dyn MessageCallback>,
        source_queue_id: String,
    ) -> TrackOutcome {
        let pipeline_key = pointer.pipeline_key().to_string();
        let application_id = pointer.id.clone();

        let mut state = self.state.write();

        if state.by_pipeline_key.contains_key(&pipeline_key) {
            return TrackOutcome::Duplicate { existing_key: pipeline_key, is_requeue: false };
        }

        if let Some(existing_key) = state.app_id_to_pipeline_key.get(&application_id).cloned() {
            if state.by_pipeline_key.contains_key(&existing_key) {
                return TrackOutcome::Duplicate { existing_key, is_requeue: true };
            }
            // Stale index entry pointing at an already-removed pipeline key.
            state.app_id_to_pipeline_key.remove(&application_id);
        }

        let tracked = TrackedMessage {
            pipeline_key: pipeline_key.clone(),
            application_id: application_id.clone(),
            broker_id: pointer.broker_message_id.clone(),
            source_queue_id,
            pointer,
            callback,
            tracked_at: Instant::now(),
        };

        state.by_pipeline_key.insert(pipeline_key.clone(), tracked);
        state.app_id_to_pipeline_key.insert(application_id, pipeline_key.clone());

        TrackOutcome::Tracked { pipeline_key }
    }

    pub fn remove(&self, pipeline_key: &str) -> Option<TrackedMessage> {
        let mut state = self.state.write();
        let removed = state.by_pipeline_key.remove(pipeline_key)?;
        if state.app_id_to_pipeline_key.get(&removed.application_id) == Some(&removed.pipeline_key) {
            state.app_id_to_pipeline_key.remove(&removed.application_id);
        }
        Some(removed)
    }

    pub fn is_in_flight(&self, application_id: &str) -> bool {
        self.state.read().app_id_to_pipeline_key.contains_key(application_id)
    }

    pub fn size(&self) -> usize {
        self.state.read().by_pipeline_key.len()
    }

    /// Snapshot of every stalled entry whose elapsed time is at least
    /// `threshold_seconds`, oldest first.
    pub fn stalled(&self, threshold_seconds: u64) -> Vec<StalledEntry> {
        let state = self.state.read();
        let mut stalled: Vec<StalledEntry> = state
            .by_pipeline_key
            .values()
            .filter(|m| m.elapsed_seconds() >= threshold_seconds)
            .map(|m| StalledEntry {
                pipeline_key: m.pipeline_key.clone(),
                application_id: m.application_id.clone(),
                pool_code: m.pointer.pool_code.clone(),
                source_queue_id: m.source_queue_id.clone(),
                elapsed_seconds: m.elapsed_seconds(),
            })
            .collect();
        stalled.sort_by(|a, b| b.elapsed_seconds.cmp(&a.elapsed_seconds));
        stalled
    }

    pub fn callback_for(&self, pipeline_key: &str) -> Option<Arc<dyn MessageCallback>> {
        self.state.read().by_pipeline_key.get(pipeline_key).map(|m| m.callback.clone())
    }

    /// Look up a tracked message by pipeline key without removing it.
    pub fn get(&self, pipeline_key: &str) -> Option<TrackedMessage> {
        self.state.read().by_pipeline_key.get(pipeline_key).cloned()
    }

    /// Drain all tracked messages, returning their callbacks so the caller
    /// can nack them. Leaves the tracker empty.
    pub fn clear(&self) -> Vec<(String, Arc<dyn MessageCallback>)> {
        let mut state = self.state.write();
        let drained: Vec<_> = state
            .by_pipeline_key
            .drain()
            .map(|(key, tracked)| (key, tracked.callback))
            .collect();
        state.app_id_to_pipeline_key.clear();
        drained
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StalledEntry {
    pub pipeline_key: String,
    pub application_id: String,
    pub pool_code: String,
    pub source_queue_id: String,
    pub elapsed_seconds: u64,
}
