// ============================================================================
// Delivery Channel
// ============================================================================
//
// Send half: retries transient transport failures with exponential backoff
// up to the configured attempt limit, then dead-letters the message and
// surfaces a terminal error. Saturation is NOT retried here; it surfaces
// immediately so the producer can apply backpressure instead of this layer
// buffering unboundedly.
//
// Receive half: hands out the transport's delivery sequence to one
// sequential consumer at a time.
//
// A DeliveryRecord is kept per in-flight send and resolved by the
// transport's acknowledgment events.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::dead_letter::DeadLetterQueue;
use crate::error::{InvokeError, SendError};
use crate::message::{DeliveryRecord, Message, MessageId};
use crate::metrics::BridgeMetrics;
use crate::transport::{AckEvent, Binding, Delivery, Inbound};

pub struct DeliveryChannel {
    binding: Arc<dyn Binding>,
    operation: String,
    records: Mutex<HashMap<MessageId, DeliveryRecord>>,
    backoff: BackoffPolicy,
    max_send_attempts: u32,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<BridgeMetrics>,
    inbound: tokio::sync::Mutex<Inbound>,
}

impl DeliveryChannel {
    pub fn new(
        binding: Arc<dyn Binding>,
        inbound: Inbound,
        config: &Config,
        dlq: Arc<DeadLetterQueue>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            binding,
            operation: config.binding_operation.clone(),
            records: Mutex::new(HashMap::new()),
            backoff: BackoffPolicy::new(config.initial_backoff, config.backoff_ceiling),
            max_send_attempts: config.max_send_attempts,
            dlq,
            metrics,
            inbound: tokio::sync::Mutex::new(inbound),
        }
    }

    /// Attempt delivery of a message to the transport.
    ///
    /// Transient failures retry in here; on exhaustion the message is
    /// dead-lettered and `SendError::Terminal` returned. Saturation and
    /// terminal transport failures short-circuit.
    pub async fn send(&self, message: &Message) -> Result<(), SendError> {
        if let Err(e) = message.validate() {
            // Never entered the transport, nothing to retry
            self.dlq.push(message.clone(), 0, &e.to_string());
            return Err(SendError::Terminal {
                attempts: 0,
                reason: format!("invalid message: {}", e),
            });
        }

        self.with_record(message.id, |_| {});
        let start = Instant::now();

        for attempt in 1..=self.max_send_attempts {
            self.with_record(message.id, |record| record.record_attempt());

            match self
                .binding
                .invoke(&self.operation, message.clone())
                .await
            {
                Ok(()) => {
                    self.with_record(message.id, |record| record.mark_sent());
                    self.metrics.messages_sent.inc();
                    self.metrics.send_latency.observe(start.elapsed().as_secs_f64());

                    if attempt > 1 {
                        info!(
                            message_id = %message.id,
                            attempt = attempt,
                            "Send succeeded after retry"
                        );
                    } else {
                        debug!(
                            message_id = %message.id,
                            binding = self.binding.name(),
                            "Message accepted by transport"
                        );
                    }
                    return Ok(());
                }
                Err(InvokeError::Saturated) => {
                    self.metrics.send_failures.inc();
                    warn!(
                        message_id = %message.id,
                        attempt = attempt,
                        "Transport saturated; surfacing backpressure"
                    );
                    return Err(SendError::Saturated { attempts: attempt });
                }
                Err(InvokeError::Terminal(reason)) => {
                    self.metrics.send_failures.inc();
                    return Err(self.fail_terminally(message, attempt, &reason));
                }
                Err(InvokeError::Transient(reason)) => {
                    self.metrics.send_failures.inc();

                    if attempt == self.max_send_attempts {
                        return Err(self.fail_terminally(
                            message,
                            attempt,
                            &format!("send attempts exhausted: {}", reason),
                        ));
                    }

                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        message_id = %message.id,
                        attempt = attempt,
                        max_attempts = self.max_send_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Send failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!()
    }

    /// The transport's delivery sequence. `None` only after shutdown.
    pub async fn recv(&self) -> Option<Delivery> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await
    }

    /// Snapshot of the delivery record for an in-flight send
    pub fn delivery_record(&self, id: MessageId) -> Option<DeliveryRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(&id).cloned())
    }

    fn fail_terminally(&self, message: &Message, attempts: u32, reason: &str) -> SendError {
        self.with_record(message.id, |record| record.mark_failed());
        self.dlq.push(message.clone(), attempts, reason);
        // The DLQ entry is the archive; drop the live record
        self.remove_record(message.id);

        SendError::Terminal {
            attempts,
            reason: reason.to_string(),
        }
    }

    fn with_record(&self, id: MessageId, update: impl FnOnce(&mut DeliveryRecord)) {
        if let Ok(mut records) = self.records.lock() {
            update(records.entry(id).or_insert_with(|| DeliveryRecord::new(id)));
        }
    }

    fn remove_record(&self, id: MessageId) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(&id);
        }
    }

    fn apply_ack_event(&self, event: AckEvent) {
        match event {
            AckEvent::Acknowledged(id) => {
                self.with_record(id, |record| record.mark_acknowledged());
                self.remove_record(id);
                debug!(message_id = %id, "Delivery acknowledged by consumer");
            }
            AckEvent::DeadLettered(id) => {
                self.with_record(id, |record| record.mark_failed());
                self.remove_record(id);
                warn!(message_id = %id, "Delivery dead-lettered by transport");
            }
        }
    }
}

/// Resolves delivery records from the transport's acknowledgment feed
pub async fn run_ack_keeper(
    channel: Arc<DeliveryChannel>,
    mut events: mpsc::UnboundedReceiver<AckEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = events.recv() => {
                let Some(event) = maybe else { break };
                channel.apply_ack_event(event);
            }
        }
    }
    debug!("Ack keeper stopped");
}
