//! Rendezvous Table: maps a request id to a one-shot slot where the
//! matching worker reply is deposited and the waiting dispatcher is
//! released. Guarded by its own mutex, distinct from the registry lock, so
//! dispatching never stalls registration (and vice versa).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use agentbridge_common::{RequestId, WorkerId};

use crate::error::BrokerError;

/// What gets deposited into a slot: either the worker's raw reply payload,
/// or an error kind (e.g. the worker reported an application-level error,
/// or it disconnected).
#[derive(Debug)]
pub enum SlotOutcome {
    Payload(String),
    Error(BrokerError),
}

struct Slot {
    worker_id: WorkerId,
    #[allow(dead_code)]
    created_at: Instant,
    sender: oneshot::Sender<SlotOutcome>,
}

pub struct RendezvousTable {
    slots: Mutex<HashMap<RequestId, Slot>>,
}

impl Default for RendezvousTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a new empty slot. Fails with an internal error if the id
    /// already exists — this should not happen, since ids are broker-minted.
    pub fn open(
        &self,
        request_id: RequestId,
        worker_id: WorkerId,
    ) -> Result<oneshot::Receiver<SlotOutcome>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap();

        if slots.contains_key(&request_id) {
            return Err(BrokerError::Internal(format!(
                "duplicate request id {request_id}"
            )));
        }

        slots.insert(
            request_id,
            Slot {
                worker_id,
                created_at: Instant::now(),
                sender: tx,
            },
        );

        Ok(rx)
    }

    /// Deposit a reply or error for `request_id`. If no slot exists, this is
    /// a stray reply: logged but not fatal.
    pub fn deposit(&self, request_id: RequestId, outcome: SlotOutcome) {
        let mut slots = self.slots.lock().unwrap();
        match slots.remove(&request_id) {
            Some(slot) => {
                // The waiter may already have timed out and dropped its
                // receiver; a failed send just means the reply is discarded.
                let _ = slot.sender.send(outcome);
            }
            None => {
                tracing::warn!(request_id = %request_id, "stray reply: no rendezvous slot");
            }
        }
    }

    /// Block the caller until either a deposit occurs or `deadline` elapses.
    /// On timeout, removes the slot and returns `BrokerError::Timeout`.
    pub async fn await_slot(
        &self,
        request_id: RequestId,
        receiver: oneshot::Receiver<SlotOutcome>,
        deadline: Instant,
    ) -> Result<SlotOutcome, BrokerError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            result = receiver => {
                result.map_err(|_| BrokerError::WorkerGone)
            }
            _ = tokio::time::sleep(remaining) => {
                self.close(request_id);
                Err(BrokerError::Timeout)
            }
        }
    }

    /// Deposit `worker_gone` into every slot assigned to `worker_id`. Called
    /// once, in a single sweep, by Worker Session teardown.
    pub fn cancel_for_worker(&self, worker_id: WorkerId) {
        let mut slots = self.slots.lock().unwrap();
        let matching: Vec<RequestId> = slots
            .iter()
            .filter(|(_, slot)| slot.worker_id == worker_id)
            .map(|(id, _)| *id)
            .collect();

        for id in matching {
            if let Some(slot) = slots.remove(&id) {
                let _ = slot.sender.send(SlotOutcome::Error(BrokerError::WorkerGone));
            }
        }
    }

    /// Remove a slot unconditionally after a terminal outcome. Idempotent.
    pub fn close(&self, request_id: RequestId) {
        self.slots.lock().unwrap().remove(&request_id);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deadline helper: `open_time + response_wait`.
pub fn deadline_from(response_wait: Duration) -> Instant {
    Instant::now() + response_wait
}
