//! HTTP surface: the OpenAI-compatible chat-completions endpoint plus
//! operational endpoints (health, stats, metrics) and the worker WebSocket
//! upgrade.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::dispatcher::Dispatcher;
use crate::registry::WorkerRegistry;
use crate::rendezvous::RendezvousTable;
use crate::session;
use crate::wire::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, ModelEntry, ModelsResponse,
    ResponseMessage, Usage,
};

pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
    pub rendezvous: Arc<RendezvousTable>,
    pub dispatcher: Dispatcher,
    pub heartbeat_interval: Duration,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", axum::routing::post(chat_completions))
        .route("/v1/models", get(models))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> impl IntoResponse {
    let model = request.model.clone();
    match state.dispatcher.dispatch(request).await {
        Ok(result) => {
            let response = ChatCompletionResponse {
                id: format!("chatcmpl-{}", agentbridge_common::RequestId::new()),
                object: "chat.completion",
                created: 0,
                model,
                choices: vec![Choice {
                    index: 0,
                    message: ResponseMessage {
                        role: "assistant",
                        content: if result.content.is_empty() {
                            None
                        } else {
                            Some(result.content)
                        },
                        tool_calls: if result.tool_calls.is_empty() {
                            None
                        } else {
                            Some(result.tool_calls)
                        },
                    },
                    finish_reason: result.finish_reason,
                }],
                usage: Usage::default(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn models() -> Json<ModelsResponse> {
    Json(ModelsResponse {
        object: "list",
        data: vec![ModelEntry {
            id: "agentbridge".into(),
            object: "model",
            owned_by: "agentbridge",
        }],
    })
}

/// Liveness probe: 200 once the server is up and the registry/rendezvous
/// table are reachable. Worker presence is a readiness concern for
/// `/stats`, not liveness — an empty pool is not a failed broker.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let body = serde_json::json!({
        "status": "healthy",
        "workers_connected": snapshot.total,
    });
    (StatusCode::OK, Json(body))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    Json(serde_json::json!({
        "total": snapshot.total,
        "idle": snapshot.idle,
        "busy": snapshot.busy,
        "pending_rendezvous": state.rendezvous.len(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        session::run(
            socket,
            Arc::clone(&state.registry),
            Arc::clone(&state.rendezvous),
            state.heartbeat_interval,
        )
        .await;
    })
}
