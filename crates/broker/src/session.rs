//! Worker Session: one instance per connected worker. Runs a reader that
//! demultiplexes inbound frames and a heartbeat ticker concurrently on a
//! single transport. Writes are serialized through a dedicated writer task
//! so frames are never interleaved.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use agentbridge_common::{RequestId, WorkerId};

use crate::error::BrokerError;
use crate::registry::{WorkerMetadata, WorkerRegistry};
use crate::rendezvous::{RendezvousTable, SlotOutcome};
use crate::wire::{self, BrokerFrame, WorkerFrame};

/// Drive a single worker's connection until it disconnects or errors.
pub async fn run(
    socket: WebSocket,
    registry: Arc<WorkerRegistry>,
    rendezvous: Arc<RendezvousTable>,
    heartbeat_interval: Duration,
) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(writer_task(sink, rx));

    let mut worker_id: Option<WorkerId> = None;
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.tick().await; // the first tick fires immediately; consume it up front

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = tx.send(frame_message(&BrokerFrame::Heartbeat));
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &mut worker_id, &registry, &rendezvous, &tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong carry no broker-level meaning
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "worker transport read error");
                        break;
                    }
                }
            }
        }
    }

    teardown(worker_id, &registry, &rendezvous);
    drop(tx);
    let _ = writer.await;
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn handle_frame(
    text: &str,
    worker_id: &mut Option<WorkerId>,
    registry: &WorkerRegistry,
    rendezvous: &RendezvousTable,
    tx: &mpsc::UnboundedSender<Message>,
) {
    match wire::parse_worker_frame(text) {
        Ok(WorkerFrame::Register {
            user_agent, origin, ..
        }) => {
            let metadata = WorkerMetadata { user_agent, origin };
            match registry.register(tx.clone(), metadata) {
                Ok(id) => {
                    *worker_id = Some(id);
                    tracing::info!(worker_id = %id, "worker connected");
                    let _ = tx.send(frame_message(&BrokerFrame::ConnectionEstablished {
                        worker_id: id.to_string(),
                    }));
                }
                Err(e) => {
                    let _ = tx.send(frame_message(&BrokerFrame::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }));
                }
            }
        }
        Ok(WorkerFrame::ClientReady) => {
            if let Some(id) = *worker_id {
                registry.mark_ready(id);
            }
        }
        Ok(WorkerFrame::HeartbeatResponse) => {
            if let Some(id) = *worker_id {
                registry.touch(id);
            }
        }
        Ok(WorkerFrame::CompletionResponse {
            request_id,
            content,
            error,
            ..
        }) => match parse_request_id(&request_id) {
            Some(id) => {
                let outcome = match error {
                    Some(message) => SlotOutcome::Error(BrokerError::TransportError(message)),
                    None => SlotOutcome::Payload(content),
                };
                rendezvous.deposit(id, outcome);
            }
            None => {
                tracing::warn!(request_id = %request_id, "completion_response carried an unparseable request id");
            }
        },
        Ok(WorkerFrame::ClientLog { message }) => {
            tracing::debug!(worker_id = ?*worker_id, log = %message, "worker log");
        }
        Err(unrecognized) => {
            let offending = unrecognized.type_name.unwrap_or_else(|| "<malformed>".into());
            tracing::warn!(frame_type = %offending, detail = %unrecognized.detail, "unrecognized worker frame");
            let _ = tx.send(frame_message(&BrokerFrame::Error {
                kind: "unknown_type".into(),
                message: unrecognized.detail,
            }));
        }
    }
}

fn parse_request_id(text: &str) -> Option<RequestId> {
    Uuid::parse_str(text).ok().map(RequestId::from_uuid)
}

fn frame_message(frame: &BrokerFrame) -> Message {
    Message::Text(serde_json::to_string(frame).unwrap_or_default().into())
}

/// Idempotent: safe to call even if the worker never completed
/// registration (`worker_id` is `None`).
fn teardown(worker_id: Option<WorkerId>, registry: &WorkerRegistry, rendezvous: &RendezvousTable) {
    if let Some(id) = worker_id {
        rendezvous.cancel_for_worker(id);
        registry.remove(id);
        tracing::info!(worker_id = %id, "worker session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_request_id() {
        let id = RequestId::new();
        assert_eq!(parse_request_id(&id.to_string()), Some(id));
    }

    #[test]
    fn rejects_malformed_request_id() {
        assert_eq!(parse_request_id("not-a-uuid"), None);
    }
}
