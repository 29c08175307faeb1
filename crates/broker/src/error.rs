use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Error kinds observable by HTTP callers and worker sessions.
///
/// Propagation policy: these never unwind across a transport boundary. They
/// are caught at the session/dispatch boundary and either surfaced to the
/// HTTP caller as a mapped status code or sent back to the worker as an
/// `error` frame.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("no last user message in request")]
    MissingUser,

    #[error("no idle worker available")]
    NoWorker,

    #[error("worker registry at capacity")]
    CapacityExhausted,

    #[error("transport write failed: {0}")]
    TransportError(String),

    #[error("worker disconnected before reply")]
    WorkerGone,

    #[error("response wait timed out")]
    Timeout,

    #[error("unrecognized frame type: {0}")]
    UnknownType(String),

    #[error("reply for unknown or closed slot {0}")]
    StrayReply(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// The error kind string carried in API responses and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::MissingUser => "missing_user",
            BrokerError::NoWorker => "no_worker",
            BrokerError::CapacityExhausted => "capacity_exhausted",
            BrokerError::TransportError(_) => "transport_error",
            BrokerError::WorkerGone => "worker_gone",
            BrokerError::Timeout => "timeout",
            BrokerError::UnknownType(_) => "unknown_type",
            BrokerError::StrayReply(_) => "stray_reply",
            BrokerError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            BrokerError::MissingUser => StatusCode::BAD_REQUEST,
            BrokerError::NoWorker => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::TransportError(_) => StatusCode::BAD_GATEWAY,
            BrokerError::WorkerGone => StatusCode::BAD_GATEWAY,
            BrokerError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::UnknownType(_) => StatusCode::BAD_REQUEST,
            BrokerError::StrayReply(_) => StatusCode::BAD_REQUEST,
            BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });

        tracing::warn!(kind = self.kind(), message = %self, "request failed");

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
