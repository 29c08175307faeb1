//! End-to-end dispatch scenarios driven against a real `WorkerRegistry` and
//! `RendezvousTable`, with a fake worker task standing in for the actual
//! WebSocket transport (it reads frames off the same channel the registry
//! writes to and deposits replies directly into the rendezvous table).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc::UnboundedReceiver;

use agentbridge_broker::dispatcher::Dispatcher;
use agentbridge_broker::registry::{WorkerMetadata, WorkerRegistry};
use agentbridge_broker::rendezvous::{RendezvousTable, SlotOutcome};
use agentbridge_broker::wire::{ChatCompletionRequest, IncomingMessage, MessageRole};
use agentbridge_common::RequestId;

fn parse_request_id(text: &str) -> RequestId {
    RequestId::from_uuid(text.parse().unwrap())
}

fn request(messages: Vec<(MessageRole, &str)>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: "gpt-4".into(),
        messages: messages
            .into_iter()
            .map(|(role, content)| IncomingMessage {
                role,
                content: content.to_string(),
            })
            .collect(),
        temperature: None,
        max_tokens: None,
        stream: None,
        tools: None,
    }
}

/// Pull the `request_id` out of the JSON frame the dispatcher sent.
fn request_id_of(message: Message) -> String {
    let text = match message {
        Message::Text(t) => t,
        other => panic!("expected a text frame, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    value["request_id"].as_str().unwrap().to_string()
}

struct Harness {
    registry: Arc<WorkerRegistry>,
    rendezvous: Arc<RendezvousTable>,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    let registry = Arc::new(WorkerRegistry::new(8, Duration::from_secs(30)));
    let rendezvous = Arc::new(RendezvousTable::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&rendezvous),
        Duration::from_secs(2),
        Duration::from_millis(200),
    );
    Harness {
        registry,
        rendezvous,
        dispatcher,
    }
}

/// Register a ready, idle worker and return its id and inbound-frame
/// receiver.
fn spawn_idle_worker(
    registry: &WorkerRegistry,
) -> (agentbridge_common::WorkerId, UnboundedReceiver<Message>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let id = registry.register(tx, WorkerMetadata::default()).unwrap();
    registry.mark_ready(id);
    (id, rx)
}

#[tokio::test]
async fn s1_one_shot_plain_text_reply() {
    let h = harness();
    let (_id, mut rx) = spawn_idle_worker(&h.registry);
    let rendezvous = Arc::clone(&h.rendezvous);

    tokio::spawn(async move {
        let frame = rx.recv().await.unwrap();
        let request_id = request_id_of(frame);
        let id = parse_request_id(&request_id);
        let reply = r#"{"content":"hello","tool_calls":null}"#;
        rendezvous.deposit(id, SlotOutcome::Payload(reply.into()));
    });

    let result = h
        .dispatcher
        .dispatch(request(vec![(MessageRole::User, "hi")]))
        .await
        .unwrap();

    assert_eq!(result.content, "hello");
    assert_eq!(result.finish_reason, "stop");
    assert!(result.tool_calls.is_empty());
}

#[tokio::test]
async fn s2_marker_delimited_tool_call_reply() {
    let h = harness();
    let (_id, mut rx) = spawn_idle_worker(&h.registry);
    let rendezvous = Arc::clone(&h.rendezvous);

    tokio::spawn(async move {
        let frame = rx.recv().await.unwrap();
        let request_id = request_id_of(frame);
        let id = parse_request_id(&request_id);
        let reply = r#"<content></content><tool_calls>[{"name":"search","arguments":{"q":"rust"}}]</tool_calls><response_done>"#;
        rendezvous.deposit(id, SlotOutcome::Payload(reply.into()));
    });

    let result = h
        .dispatcher
        .dispatch(request(vec![(MessageRole::User, "search for rust")]))
        .await
        .unwrap();

    assert_eq!(result.finish_reason, "tool_calls");
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].function.name, "search");
}

#[tokio::test]
async fn s3_fenced_json_reply() {
    let h = harness();
    let (_id, mut rx) = spawn_idle_worker(&h.registry);
    let rendezvous = Arc::clone(&h.rendezvous);

    tokio::spawn(async move {
        let frame = rx.recv().await.unwrap();
        let request_id = request_id_of(frame);
        let id = parse_request_id(&request_id);
        let reply = "Sure thing:\n```json\n{\"content\":\"done\",\"finish_reason\":\"stop\"}\n```";
        rendezvous.deposit(id, SlotOutcome::Payload(reply.into()));
    });

    let result = h
        .dispatcher
        .dispatch(request(vec![(MessageRole::User, "go")]))
        .await
        .unwrap();

    assert_eq!(result.content, "done");
}

/// Read one forwarded `completion_request` frame, reply with a plain
/// `{"content": ...}` object, and return whether the frame carried any
/// inline system messages.
async fn reply_and_report_system_carriage(
    rx: &mut UnboundedReceiver<Message>,
    rendezvous: &RendezvousTable,
) -> bool {
    let frame = rx.recv().await.unwrap();
    let text = match frame {
        Message::Text(t) => t,
        other => panic!("expected a text frame, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    let request_id = value["request_id"].as_str().unwrap().to_string();
    let carries_system = value["messages"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m["role"] == "system");

    let id = parse_request_id(&request_id);
    rendezvous.deposit(id, SlotOutcome::Payload(r#"{"content":"ok"}"#.into()));
    carries_system
}

#[tokio::test]
async fn s4_cache_elision_across_repeated_system_prompts() {
    let h = harness();
    let (_id, mut rx) = spawn_idle_worker(&h.registry);
    let rendezvous = Arc::clone(&h.rendezvous);

    // One fake-worker task serving all three requests in order on the same
    // worker, so the per-worker digest cache actually carries across calls.
    let (carriage_tx, mut carriage_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        for _ in 0..3 {
            let carried = reply_and_report_system_carriage(&mut rx, &rendezvous).await;
            carriage_tx.send(carried).unwrap();
        }
    });

    let with_prompt = |prompt: &str, user: &str| {
        request(vec![(MessageRole::System, prompt), (MessageRole::User, user)])
    };

    // First call: no cache yet, system messages must be carried.
    h.dispatcher
        .dispatch(with_prompt("be terse", "one"))
        .await
        .unwrap();
    assert!(carriage_rx.recv().await.unwrap());

    // Second call, same system prompt, same worker: elided.
    h.dispatcher
        .dispatch(with_prompt("be terse", "two"))
        .await
        .unwrap();
    assert!(!carriage_rx.recv().await.unwrap());

    // Third call, different system prompt: carriage restored.
    h.dispatcher
        .dispatch(with_prompt("be verbose", "three"))
        .await
        .unwrap();
    assert!(carriage_rx.recv().await.unwrap());
}

#[tokio::test]
async fn no_idle_worker_is_rejected_with_no_worker() {
    let h = harness();
    // No worker registered at all.
    let result = h
        .dispatcher
        .dispatch(request(vec![(MessageRole::User, "hi")]))
        .await;

    assert!(matches!(
        result,
        Err(agentbridge_broker::error::BrokerError::NoWorker)
    ));
}

#[tokio::test]
async fn s5_response_wait_expires_without_a_reply() {
    let registry = Arc::new(WorkerRegistry::new(8, Duration::from_secs(30)));
    let rendezvous = Arc::new(RendezvousTable::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&rendezvous),
        Duration::from_millis(50),
        Duration::from_millis(200),
    );
    let (_id, mut rx) = spawn_idle_worker(&registry);

    // Drain the frame but never reply.
    tokio::spawn(async move {
        let _ = rx.recv().await;
    });

    let result = dispatcher
        .dispatch(request(vec![(MessageRole::User, "hi")]))
        .await;

    assert!(matches!(
        result,
        Err(agentbridge_broker::error::BrokerError::Timeout)
    ));
    // The worker is released back to idle even though its reply never came.
    assert_eq!(registry.snapshot().idle, 1);
}

#[tokio::test]
async fn s6_worker_disconnects_mid_dispatch_reports_worker_gone() {
    let h = harness();
    let (worker_id, mut rx) = spawn_idle_worker(&h.registry);
    let registry = Arc::clone(&h.registry);
    let rendezvous = Arc::clone(&h.rendezvous);

    tokio::spawn(async move {
        let _frame = rx.recv().await.unwrap();
        // Simulate what Worker Session teardown does on a closed socket.
        rendezvous.cancel_for_worker(worker_id);
        registry.remove(worker_id);
    });

    let result = h
        .dispatcher
        .dispatch(request(vec![(MessageRole::User, "hi")]))
        .await;

    assert!(matches!(
        result,
        Err(agentbridge_broker::error::BrokerError::WorkerGone)
    ));
}

#[tokio::test]
async fn retry_on_transport_failure_lands_on_a_different_worker() {
    let h = harness();

    // Registered first so its last-heartbeat-at is older: the tie-break
    // (most-recent-first) picks the bad worker on the initial claim.
    let (_good_id, mut good_rx) = spawn_idle_worker(&h.registry);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (_bad_id, bad_rx) = spawn_idle_worker(&h.registry);
    // Drop the receiver so the bad worker's writer channel is closed and
    // `registry.send` fails on the first attempt.
    drop(bad_rx);

    let rendezvous = Arc::clone(&h.rendezvous);
    tokio::spawn(async move {
        let frame = good_rx.recv().await.unwrap();
        let request_id = request_id_of(frame);
        let id = parse_request_id(&request_id);
        rendezvous.deposit(id, SlotOutcome::Payload(r#"{"content":"ok"}"#.into()));
    });

    let result = h
        .dispatcher
        .dispatch(request(vec![(MessageRole::User, "hi")]))
        .await
        .unwrap();

    assert_eq!(result.content, "ok");
    // The failed worker was removed rather than released back to idle.
    assert_eq!(h.registry.snapshot().total, 1);
    assert_eq!(h.registry.snapshot().idle, 1);
}
