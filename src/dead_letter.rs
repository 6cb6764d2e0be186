// ============================================================================
// Dead Letter Queue
// ============================================================================
//
// Terminal holding path for messages that cannot be delivered or processed
// after exhausting policy limits. Entries are counted and logged under the
// "dlq" target at error level so operators can alert on them; nothing is
// ever dropped silently.
//
// Sources:
// - send attempts exhausted (delivery channel)
// - delivery attempts exhausted (transport pump)
// - handler dead-letter disposition, e.g. malformed payload (receiver)
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::error;

use crate::message::Message;
use crate::metrics::BridgeMetrics;

/// Retained entries are capped; beyond this the oldest entry is dropped
/// (the counter metric keeps the true total).
const MAX_RETAINED: usize = 1024;

/// A message that exhausted its policy limits
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub message: Message,
    /// Number of attempts made before giving up
    pub attempts: u32,
    /// Last failure, human-readable
    pub failure_reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetterMessage>>,
    metrics: Arc<BridgeMetrics>,
}

impl DeadLetterQueue {
    pub fn new(metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            metrics,
        }
    }

    /// Move a message to the dead-letter queue
    pub fn push(&self, message: Message, attempts: u32, failure_reason: &str) {
        let entry = DeadLetterMessage {
            message,
            attempts,
            failure_reason: failure_reason.to_string(),
            dead_lettered_at: Utc::now(),
        };

        // Recoverable by ops: the full entry is in the log even if the
        // in-memory queue has rotated past it
        error!(
            target: "dlq",
            message_id = %entry.message.id,
            attempts = attempts,
            failure_reason = failure_reason,
            payload = %serde_json::to_string(&entry).unwrap_or_default(),
            "Message moved to dead letter queue"
        );

        self.metrics.dead_lettered.inc();

        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() >= MAX_RETAINED {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all retained entries, e.g. for inspection or replay tooling
    pub fn drain(&self) -> Vec<DeadLetterMessage> {
        match self.entries.lock() {
            Ok(mut entries) => entries.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}
