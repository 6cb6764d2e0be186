// ============================================================================
// HTTP Routes
// ============================================================================
//
// The transport-facing surface: the transport delivers messages with an
// HTTP POST to /{binding_name} and interprets the status code as the
// acknowledgment. 2xx means acknowledged (including poison payloads, which
// are dead-lettered here and must NOT be redelivered); non-2xx tells the
// transport to redeliver.
//
// ============================================================================

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::dead_letter::DeadLetterQueue;
use crate::error::ReceiveError;
use crate::message::{Message, MessageId};
use crate::metrics::BridgeMetrics;
use crate::receiver::ReceiverService;

pub struct HttpState {
    pub service: Arc<ReceiverService>,
    pub dlq: Arc<DeadLetterQueue>,
    pub metrics: Arc<BridgeMetrics>,
}

/// Create the application router.
///
/// `binding_route` is `/{binding_name}`, the fixed route the transport
/// POSTs deliveries to.
pub fn create_router(binding_route: &str, state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route(binding_route, post(receive_message))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// POST /{binding_name}
/// Receives one delivered message and echoes the acknowledgment
async fn receive_message(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ReceiveError> {
    let id = message_id_from(&headers, &body);
    let message = Message::new(id, body.to_vec());

    match state.service.on_message(&message).await {
        Ok(ack) => Ok((StatusCode::OK, ack.body).into_response()),
        Err(ReceiveError::Decode(reason)) => {
            // Poison payload: dead-letter and acknowledge with 2xx so the
            // transport never redelivers it
            state
                .dlq
                .push(message, 1, &format!("payload decode failed: {}", reason));
            Ok((StatusCode::OK, "dead-lettered").into_response())
        }
        // Effect failures map to 500: the transport redelivers
        Err(err) => Err(err),
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_endpoint(State(state): State<Arc<HttpState>>) -> Response {
    match state.metrics.gather() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to gather metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The producer-assigned id travels in the X-Message-Id header. Transports
/// that do not forward one get a deterministic id derived from the payload,
/// so duplicate deliveries of the same body still collapse.
fn message_id_from(headers: &HeaderMap, body: &[u8]) -> MessageId {
    headers
        .get("x-message-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(MessageId)
        .unwrap_or_else(|| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            body.hash(&mut hasher);
            MessageId(hasher.finish())
        })
}
