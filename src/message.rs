use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Producer-assigned message identifier.
///
/// Ids are a monotonic sequence per producer instance and are never reused
/// within a process lifetime. They double as the idempotency key on the
/// receiving side.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message traveling through the bridge.
///
/// The payload is opaque at the channel layer; the bridge's own producer
/// encodes a JSON integer counter (the binding's native representation).
/// Payloads are immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Validate message structure before it enters the transport
    pub fn validate(&self) -> Result<()> {
        if self.payload.is_empty() {
            anyhow::bail!("payload is required");
        }
        Ok(())
    }
}

/// Send-side lifecycle of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    /// Created, not yet accepted by the transport
    Pending,
    /// Accepted by the transport, awaiting consumer acknowledgment
    Sent,
    /// Consumer acknowledged processing
    Acknowledged,
    /// Attempts exhausted; terminal
    Failed,
}

/// Bookkeeping record for one send.
///
/// Created on the first send attempt, mutated on each retry, and removed
/// once the message is acknowledged or archived to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: Utc::now(),
        }
    }

    /// Record one send attempt
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt_at = Utc::now();
    }

    pub fn mark_sent(&mut self) {
        self.status = DeliveryStatus::Sent;
    }

    pub fn mark_acknowledged(&mut self) {
        self.status = DeliveryStatus::Acknowledged;
    }

    /// Terminal; no further transitions are valid
    pub fn mark_failed(&mut self) {
        self.status = DeliveryStatus::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Acknowledged | DeliveryStatus::Failed
        )
    }
}
