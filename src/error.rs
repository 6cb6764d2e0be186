// ============================================================================
// Error Taxonomy
// ============================================================================
//
// Transport errors (InvokeError) are retried locally by the delivery channel
// up to policy limits before surfacing as SendError. Receiver errors
// (ReceiveError) are never retried by a second loop on top of transport
// redelivery: an effect failure withholds the acknowledgment and lets the
// transport redeliver; a decode failure is dead-lettered immediately.
//
// ============================================================================

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by `Binding::invoke`
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Transient transport failure, safe to retry
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Transport is saturated; the caller should apply backpressure
    /// instead of retrying immediately
    #[error("transport saturated")]
    Saturated,

    /// Terminal transport failure, retrying cannot help
    #[error("terminal transport failure: {0}")]
    Terminal(String),
}

/// Errors surfaced by `DeliveryChannel::send` after its retry policy ran
#[derive(Debug, Error)]
pub enum SendError {
    /// Transport reported saturation. The message was NOT queued; the
    /// producer is expected to slow down and retry the same message.
    #[error("transport saturated after {attempts} attempt(s)")]
    Saturated { attempts: u32 },

    /// Attempts exhausted or terminal transport failure.
    /// The message has been dead-lettered by the channel.
    #[error("send failed terminally after {attempts} attempt(s): {reason}")]
    Terminal { attempts: u32, reason: String },
}

/// Idempotency store failure.
///
/// The receiver treats an unreadable store as "unknown state" and degrades
/// to at-least-once processing for the affected message.
#[derive(Debug, Error)]
#[error("idempotency store unavailable: {0}")]
pub struct StoreError(pub String);

/// Errors surfaced by `ReceiverService::on_message`
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Malformed payload. Dead-lettered on first attempt, never redelivered.
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// Application effect failed. The acknowledgment is withheld so the
    /// transport redelivers.
    #[error("message effect failed: {0}")]
    Effect(String),
}

impl ReceiveError {
    /// HTTP status for the transport-facing route.
    /// Non-2xx tells the transport to redeliver.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReceiveError::Decode(_) => StatusCode::BAD_REQUEST,
            ReceiveError::Effect(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ReceiveError::Decode(_) => "DECODE_ERROR",
            ReceiveError::Effect(_) => "EFFECT_ERROR",
        }
    }

    /// Log this error with the appropriate level
    pub fn log(&self) {
        match self {
            ReceiveError::Effect(_) => {
                tracing::error!(error = %self, error_code = %self.error_code(), "Message processing failed");
            }
            ReceiveError::Decode(_) => {
                tracing::warn!(error = %self, error_code = %self.error_code(), "Malformed payload rejected");
            }
        }
    }
}

impl IntoResponse for ReceiveError {
    fn into_response(self) -> axum::response::Response {
        self.log();

        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
            "error_code": self.error_code(),
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_error_is_retryable_status() {
        let err = ReceiveError::Effect("database down".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_decode_error_is_client_status() {
        let err = ReceiveError::Decode("not an integer".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "DECODE_ERROR");
    }

    #[test]
    fn test_send_error_display() {
        let err = SendError::Terminal {
            attempts: 5,
            reason: "broker unreachable".to_string(),
        };
        assert!(err.to_string().contains("5 attempt(s)"));
        assert!(err.to_string().contains("broker unreachable"));
    }
}
