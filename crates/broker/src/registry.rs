//! Worker Registry: the set of live workers under a single mutual-exclusion
//! discipline. All reads and writes go through this module — see the
//! "two locks, narrow scope" design note. `std::sync::Mutex` is correct here
//! because the lock is never held across an await point; every method below
//! is synchronous.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::ws::Message as WsMessage;
use tokio::sync::mpsc;

use agentbridge_common::WorkerId;

use crate::error::{BrokerError, Result};
use crate::wire::BrokerFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Idle,
    Busy,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerMetadata {
    pub user_agent: Option<String>,
    pub origin: Option<String>,
}

/// A channel to the worker's single writer task. Sending here never blocks
/// on transport I/O — the writer task owns the actual socket and serializes
/// writes on the worker's behalf.
pub type WorkerSender = mpsc::UnboundedSender<WsMessage>;

struct WorkerRecord {
    status: WorkerStatus,
    last_heartbeat_at: Instant,
    connected_at: Instant,
    last_activity_at: Instant,
    metadata: WorkerMetadata,
    system_prompt_digest: Option<String>,
    tools_digest: Option<String>,
    sender: WorkerSender,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrySnapshot {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
}

pub struct WorkerRegistry {
    workers: Mutex<HashMap<WorkerId, WorkerRecord>>,
    max_workers: usize,
    liveness_window: Duration,
}

impl WorkerRegistry {
    pub fn new(max_workers: usize, liveness_window: Duration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            max_workers,
            liveness_window,
        }
    }

    /// Register a newly-connected worker in state READY.
    pub fn register(&self, sender: WorkerSender, metadata: WorkerMetadata) -> Result<WorkerId> {
        let mut workers = self.workers.lock().unwrap();

        if workers.len() >= self.max_workers {
            return Err(BrokerError::CapacityExhausted);
        }

        let id = WorkerId::new();
        let now = Instant::now();
        workers.insert(
            id,
            WorkerRecord {
                status: WorkerStatus::Ready,
                last_heartbeat_at: now,
                connected_at: now,
                last_activity_at: now,
                metadata,
                system_prompt_digest: None,
                tools_digest: None,
                sender,
            },
        );

        tracing::info!(worker_id = %id, "worker registered");
        Ok(id)
    }

    /// READY->IDLE or BUSY->IDLE. No-op when already IDLE.
    pub fn mark_ready(&self, id: WorkerId) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(record) = workers.get_mut(&id) {
            if record.status != WorkerStatus::Idle {
                record.status = WorkerStatus::Idle;
            }
            record.last_activity_at = Instant::now();
        }
    }

    /// Select one IDLE worker, tie-broken most-recently-heartbeat-first,
    /// and atomically transition it to BUSY. O(n) over idle workers.
    pub fn claim_idle(&self) -> Option<WorkerId> {
        let mut workers = self.workers.lock().unwrap();

        let chosen = workers
            .iter()
            .filter(|(_, record)| record.status == WorkerStatus::Idle)
            .max_by_key(|(_, record)| record.last_heartbeat_at)
            .map(|(id, _)| *id);

        if let Some(id) = chosen {
            if let Some(record) = workers.get_mut(&id) {
                record.status = WorkerStatus::Busy;
            }
        }

        chosen
    }

    /// BUSY->IDLE. Must be called exactly once per successful claim.
    pub fn release(&self, id: WorkerId) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(record) = workers.get_mut(&id) {
            record.status = WorkerStatus::Idle;
        }
    }

    /// Refresh last-heartbeat-at.
    pub fn touch(&self, id: WorkerId) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(record) = workers.get_mut(&id) {
            record.last_heartbeat_at = Instant::now();
            record.last_activity_at = Instant::now();
        }
    }

    /// Remove every worker whose last-heartbeat-at precedes
    /// `now - liveness_window`. Returns the evicted ids so the caller can
    /// fail any rendezvous slots still assigned to them — the registry does
    /// not reach into the rendezvous table directly, to keep the two locks
    /// independent.
    pub fn evict_stale(&self) -> Vec<WorkerId> {
        let mut workers = self.workers.lock().unwrap();
        let now = Instant::now();
        let cutoff = self.liveness_window;

        let stale: Vec<WorkerId> = workers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_heartbeat_at) > cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            workers.remove(id);
            tracing::warn!(worker_id = %id, "worker evicted for missed heartbeats");
        }
        if !stale.is_empty() {
            metrics::counter!("broker.registry.evicted").increment(stale.len() as u64);
        }

        stale
    }

    /// Unconditionally remove a worker (disconnect / explicit teardown).
    pub fn remove(&self, id: WorkerId) {
        let mut workers = self.workers.lock().unwrap();
        if workers.remove(&id).is_some() {
            tracing::info!(worker_id = %id, "worker removed");
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let workers = self.workers.lock().unwrap();
        let mut snapshot = RegistrySnapshot {
            total: workers.len(),
            ..Default::default()
        };
        for record in workers.values() {
            match record.status {
                WorkerStatus::Idle => snapshot.idle += 1,
                WorkerStatus::Busy => snapshot.busy += 1,
                WorkerStatus::Ready => {}
            }
        }
        snapshot
    }

    /// Read the worker's cached digests, for the Request Normalizer's
    /// cache-hit comparison.
    pub fn digests(&self, id: WorkerId) -> Option<(Option<String>, Option<String>)> {
        let workers = self.workers.lock().unwrap();
        workers
            .get(&id)
            .map(|r| (r.system_prompt_digest.clone(), r.tools_digest.clone()))
    }

    /// Update the worker's system-prompt digest. Only ever called on
    /// successful transmit (cache monotonicity, invariant 4).
    pub fn update_system_prompt_digest(&self, id: WorkerId, digest: String) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(record) = workers.get_mut(&id) {
            record.system_prompt_digest = Some(digest);
        }
    }

    /// Update the worker's tools digest, independent of the prompt digest
    /// (see "cache key independence" design note).
    pub fn update_tools_digest(&self, id: WorkerId, digest: String) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(record) = workers.get_mut(&id) {
            record.tools_digest = Some(digest);
        }
    }

    /// Enqueue a frame on the worker's writer channel. Never blocks on
    /// transport I/O; the registry lock is held only long enough to clone
    /// the sender handle.
    pub fn send(&self, id: WorkerId, frame: &BrokerFrame) -> Result<()> {
        let sender = {
            let workers = self.workers.lock().unwrap();
            workers
                .get(&id)
                .map(|r| r.sender.clone())
                .ok_or(BrokerError::WorkerGone)?
        };

        let text = serde_json::to_string(frame)
            .map_err(|e| BrokerError::Internal(format!("frame serialization failed: {e}")))?;

        sender
            .send(WsMessage::Text(text.into()))
            .map_err(|_| BrokerError::TransportError("writer channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(8, Duration::from_secs(30))
    }

    fn connect(registry: &WorkerRegistry) -> (WorkerId, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry
            .register(tx, WorkerMetadata::default())
            .expect("register");
        (id, rx)
    }

    #[test]
    fn claim_idle_returns_none_when_nothing_ready() {
        let registry = registry();
        let (id, _rx) = connect(&registry);
        // Still READY, never marked ready -> not selectable.
        assert!(registry.claim_idle().is_none());
        registry.mark_ready(id);
        assert_eq!(registry.claim_idle(), Some(id));
    }

    #[test]
    fn claim_idle_is_busy_exclusive() {
        let registry = registry();
        let (id, _rx) = connect(&registry);
        registry.mark_ready(id);
        assert_eq!(registry.claim_idle(), Some(id));
        // Now BUSY: a second claim must not return it again.
        assert!(registry.claim_idle().is_none());
        registry.release(id);
        assert_eq!(registry.claim_idle(), Some(id));
    }

    #[test]
    fn tie_break_prefers_most_recent_heartbeat() {
        let registry = registry();
        let (older, _rx1) = connect(&registry);
        std::thread::sleep(Duration::from_millis(5));
        let (newer, _rx2) = connect(&registry);
        registry.mark_ready(older);
        registry.mark_ready(newer);
        assert_eq!(registry.claim_idle(), Some(newer));
    }

    #[test]
    fn evict_stale_removes_expired_workers_only() {
        let registry = WorkerRegistry::new(8, Duration::from_millis(10));
        let (id, _rx) = connect(&registry);
        registry.mark_ready(id);
        std::thread::sleep(Duration::from_millis(20));
        let evicted = registry.evict_stale();
        assert_eq!(evicted, vec![id]);
        assert_eq!(registry.snapshot().total, 0);
    }

    #[test]
    fn capacity_exhausted_rejects_registration() {
        let registry = WorkerRegistry::new(1, Duration::from_secs(30));
        let (_tx1, _rx1) = mpsc::unbounded_channel();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        registry
            .register(tx1, WorkerMetadata::default())
            .expect("first registration succeeds");
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let err = registry
            .register(tx2, WorkerMetadata::default())
            .unwrap_err();
        assert!(matches!(err, BrokerError::CapacityExhausted));
    }

    #[test]
    fn digests_are_independent() {
        let registry = registry();
        let (id, _rx) = connect(&registry);
        registry.update_system_prompt_digest(id, "sys-digest".into());
        let (sys, tools) = registry.digests(id).unwrap();
        assert_eq!(sys.as_deref(), Some("sys-digest"));
        assert!(tools.is_none());
    }
}
