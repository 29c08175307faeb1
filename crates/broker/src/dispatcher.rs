//! Dispatcher: the single operation exposed to the HTTP layer. Selects an
//! idle worker, forwards a normalized request, awaits the reply with a
//! timeout, and returns the parsed completion result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agentbridge_common::{RequestId, WorkerId};

use crate::error::{BrokerError, Result};
use crate::normalizer::{self, Normalized};
use crate::parser::{self, CompletionResult};
use crate::registry::WorkerRegistry;
use crate::rendezvous::{self, RendezvousTable, SlotOutcome};
use crate::wire::{BrokerFrame, ChatCompletionRequest, ForwardedMessage, MessageRole};

pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    rendezvous: Arc<RendezvousTable>,
    response_wait: Duration,
    acquire_wait: Duration,
}

/// Poll interval while waiting for an idle worker to appear.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Maximum number of workers tried for a single dispatch: the original
/// claim plus one retry on transport failure (§4.4 step 3).
const MAX_SEND_ATTEMPTS: u32 = 2;

enum AttemptOutcome {
    TransportFailed,
    Done(Result<CompletionResult>),
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        rendezvous: Arc<RendezvousTable>,
        response_wait: Duration,
        acquire_wait: Duration,
    ) -> Self {
        Self {
            registry,
            rendezvous,
            response_wait,
            acquire_wait,
        }
    }

    pub async fn dispatch(&self, request: ChatCompletionRequest) -> Result<CompletionResult> {
        let normalized = normalizer::normalize(&request)?;

        let mut attempts_left = MAX_SEND_ATTEMPTS;
        loop {
            let worker_id = match self.claim_with_retry().await {
                Some(id) => id,
                None => {
                    metrics::counter!("broker.dispatch.no_worker").increment(1);
                    return Err(BrokerError::NoWorker);
                }
            };

            match self.attempt(worker_id, &normalized).await {
                AttemptOutcome::Done(result) => {
                    match &result {
                        Ok(_) => metrics::counter!("broker.dispatch.ok").increment(1),
                        Err(e) => metrics::counter!("broker.dispatch.error", "kind" => e.kind()).increment(1),
                    }
                    return result;
                }
                AttemptOutcome::TransportFailed => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(BrokerError::TransportError(
                            "transmit failed on retry".into(),
                        ));
                    }
                    tracing::warn!(worker_id = %worker_id, "transmit failed, retrying on a different worker");
                }
            }
        }
    }

    /// Repeatedly call `registry.claim_idle()` until one succeeds or the
    /// acquisition deadline elapses. Also runs eviction opportunistically
    /// before each claim, ahead of the periodic tick in `main.rs` (§4.1).
    async fn claim_with_retry(&self) -> Option<WorkerId> {
        let deadline = Instant::now() + self.acquire_wait;
        loop {
            for worker_id in self.registry.evict_stale() {
                self.rendezvous.cancel_for_worker(worker_id);
            }
            if let Some(id) = self.registry.claim_idle() {
                return Some(id);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
        }
    }

    async fn attempt(&self, worker_id: WorkerId, normalized: &Normalized) -> AttemptOutcome {
        let request_id = RequestId::new();

        let (cached_system, cached_tools) =
            self.registry.digests(worker_id).unwrap_or((None, None));
        let system_elided = cached_system.as_deref() == Some(normalized.system_digest.as_str());
        let tools_elided = matches!(
            (&normalized.tools_digest, &cached_tools),
            (Some(digest), Some(cached)) if digest == cached
        );

        let mut messages = Vec::new();
        if !system_elided {
            messages.extend(normalized.system_messages.iter().map(|text| ForwardedMessage {
                role: MessageRole::System,
                content: text.clone(),
            }));
        }
        messages.push(ForwardedMessage {
            role: MessageRole::User,
            content: normalized.last_user_message.clone(),
        });

        let frame = BrokerFrame::CompletionRequest {
            request_id: request_id.to_string(),
            model: normalized.model.clone(),
            messages,
            temperature: normalized.temperature,
            max_tokens: normalized.max_tokens,
            stream: normalized.stream,
            tools: if tools_elided {
                None
            } else {
                normalized.tools.clone()
            },
        };

        let receiver = match self.rendezvous.open(request_id, worker_id) {
            Ok(rx) => rx,
            Err(e) => {
                self.registry.release(worker_id);
                return AttemptOutcome::Done(Err(e));
            }
        };

        if let Err(e) = self.registry.send(worker_id, &frame) {
            self.rendezvous.close(request_id);
            // Remove rather than release: the transport is known bad, and
            // releasing to IDLE would let the single allowed retry (§4.4
            // step 3, "a different worker") immediately re-select the same
            // worker via the unchanged last-heartbeat-at tie-break.
            self.registry.remove(worker_id);
            tracing::warn!(worker_id = %worker_id, error = %e, "worker send failed, removing worker");
            return AttemptOutcome::TransportFailed;
        }

        // Commit callback: only ever updates a digest on successful
        // transmit (cache monotonicity, invariant 4), and the two caches
        // are updated independently of one another.
        if !system_elided {
            self.registry
                .update_system_prompt_digest(worker_id, normalized.system_digest.clone());
        }
        if let (false, Some(digest)) = (tools_elided, &normalized.tools_digest) {
            self.registry.update_tools_digest(worker_id, digest.clone());
        }

        let deadline = rendezvous::deadline_from(self.response_wait);
        let outcome = self.rendezvous.await_slot(request_id, receiver, deadline).await;
        self.rendezvous.close(request_id);

        let result = match outcome {
            Ok(SlotOutcome::Payload(payload)) => {
                self.registry.release(worker_id);
                Ok(parser::parse(&payload, request_id))
            }
            Ok(SlotOutcome::Error(kind)) => {
                self.registry.release(worker_id);
                Err(kind)
            }
            Err(BrokerError::Timeout) => {
                // Reply may still arrive later as a stray and be discarded.
                self.registry.release(worker_id);
                Err(BrokerError::Timeout)
            }
            Err(BrokerError::WorkerGone) => {
                // Session teardown already removed the worker from the
                // registry; nothing left to release.
                Err(BrokerError::WorkerGone)
            }
            Err(other) => {
                self.registry.release(worker_id);
                Err(other)
            }
        };

        AttemptOutcome::Done(result)
    }
}
