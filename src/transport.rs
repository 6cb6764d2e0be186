// ============================================================================
// Transport Binding
// ============================================================================
//
// The external message transport is opaque to the bridge: producers invoke a
// named binding with an operation and a payload, and the transport delivers
// to the consumer, redelivering whenever an acknowledgment is lost.
//
// `InProcessBinding` stands in for that transport and honors its contract:
// - bounded intake queue; a full queue is a backpressure signal, not an
//   unbounded in-memory buffer
// - deliveries carry a one-shot disposition (ack / nack / dead-letter)
// - a delivery with no disposition inside the visibility timeout is
//   considered lost and is redelivered
// - a message exceeding the delivery attempt limit is dead-lettered and
//   acknowledged internally so it can never loop forever
//
// Redeliveries travel on a separate unbounded lane so requeueing can never
// deadlock against the bounded producer-facing queue.
//
// ============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dead_letter::DeadLetterQueue;
use crate::error::InvokeError;
use crate::message::{Message, MessageId};

/// Opaque send half of the transport
#[async_trait]
pub trait Binding: Send + Sync {
    /// Name the binding is registered under
    fn name(&self) -> &str;

    /// Hand a message to the transport. Returning `Ok` means the transport
    /// accepted the message for (asynchronous) delivery.
    async fn invoke(&self, operation: &str, message: Message) -> Result<(), InvokeError>;
}

/// How a consumer resolved a delivery
#[derive(Debug)]
pub enum Disposition {
    /// Processed; do not redeliver
    Ack,
    /// Processing failed; redeliver
    Nack,
    /// Poison message; record in the DLQ and do not redeliver
    DeadLetter(String),
}

/// Transport-to-producer acknowledgment feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// The consumer acknowledged this message
    Acknowledged(MessageId),
    /// The transport gave up on this message and dead-lettered it
    DeadLettered(MessageId),
}

/// One inbound message plus its disposition handle.
///
/// Dropping a `Delivery` without resolving it counts as a lost
/// acknowledgment: the transport will redeliver.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    /// 1-based delivery attempt number
    pub attempt: u32,
    disposition: Option<oneshot::Sender<Disposition>>,
}

impl Delivery {
    pub fn ack(mut self) {
        self.resolve(Disposition::Ack);
    }

    pub fn nack(mut self) {
        self.resolve(Disposition::Nack);
    }

    pub fn dead_letter(mut self, reason: impl Into<String>) {
        self.resolve(Disposition::DeadLetter(reason.into()));
    }

    fn resolve(&mut self, disposition: Disposition) {
        if let Some(tx) = self.disposition.take() {
            // The pump may have timed this delivery out already; that race
            // resolves as a redelivery, which consumers must tolerate anyway
            let _ = tx.send(disposition);
        }
    }
}

/// Consumer half of the transport: a lazy, infinite sequence of deliveries.
///
/// Yields `None` only once the transport has shut down. Restartable in the
/// sense that any sequential consumer may resume calling `recv`.
pub struct Inbound {
    rx: mpsc::Receiver<Delivery>,
}

impl Inbound {
    pub(crate) fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

struct QueueEntry {
    message: Message,
    attempt: u32,
}

/// In-process stand-in for the external transport binding
pub struct InProcessBinding {
    name: String,
    operation: String,
    queue: mpsc::Sender<QueueEntry>,
}

#[async_trait]
impl Binding for InProcessBinding {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, operation: &str, message: Message) -> Result<(), InvokeError> {
        if operation != self.operation {
            return Err(InvokeError::Terminal(format!(
                "binding '{}' does not support operation '{}'",
                self.name, operation
            )));
        }

        self.queue
            .try_send(QueueEntry {
                message,
                attempt: 1,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => InvokeError::Saturated,
                mpsc::error::TrySendError::Closed(_) => {
                    InvokeError::Terminal("transport queue closed".to_string())
                }
            })
    }
}

/// Moves queued messages to the consumer and enforces redelivery semantics
pub struct DeliveryPump {
    queue_rx: mpsc::Receiver<QueueEntry>,
    redelivery_rx: mpsc::UnboundedReceiver<QueueEntry>,
    redelivery_tx: mpsc::UnboundedSender<QueueEntry>,
    out_tx: mpsc::Sender<Delivery>,
    ack_tx: mpsc::UnboundedSender<AckEvent>,
    dlq: Arc<DeadLetterQueue>,
    visibility_timeout: std::time::Duration,
    max_delivery_attempts: u32,
    shutdown: watch::Receiver<bool>,
}

impl DeliveryPump {
    pub async fn run(mut self) {
        info!(
            visibility_timeout_ms = self.visibility_timeout.as_millis() as u64,
            max_delivery_attempts = self.max_delivery_attempts,
            "Transport delivery pump started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Redeliveries take priority over fresh messages
            let entry = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(entry) = self.redelivery_rx.recv() => entry,
                maybe = self.queue_rx.recv() => match maybe {
                    Some(entry) => entry,
                    None => break,
                },
            };

            if entry.attempt > self.max_delivery_attempts {
                warn!(
                    message_id = %entry.message.id,
                    attempts = entry.attempt - 1,
                    "Delivery attempts exhausted"
                );
                self.dlq.push(
                    entry.message.clone(),
                    entry.attempt - 1,
                    "delivery attempts exhausted",
                );
                let _ = self.ack_tx.send(AckEvent::DeadLettered(entry.message.id));
                continue;
            }

            let (disposition_tx, disposition_rx) = oneshot::channel();
            let delivery = Delivery {
                message: entry.message.clone(),
                attempt: entry.attempt,
                disposition: Some(disposition_tx),
            };

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                sent = self.out_tx.send(delivery) => {
                    if sent.is_err() {
                        info!("Delivery consumer gone; transport pump stopping");
                        break;
                    }
                }
            }

            self.spawn_disposition_watcher(entry, disposition_rx);
        }

        info!("Transport delivery pump stopped");
    }

    /// Waits (off the pump loop, so deliveries stay concurrent) for the
    /// consumer's disposition and schedules redelivery or dead-lettering.
    fn spawn_disposition_watcher(
        &self,
        entry: QueueEntry,
        disposition_rx: oneshot::Receiver<Disposition>,
    ) {
        let redelivery_tx = self.redelivery_tx.clone();
        let ack_tx = self.ack_tx.clone();
        let dlq = self.dlq.clone();
        let visibility_timeout = self.visibility_timeout;

        tokio::spawn(async move {
            let id = entry.message.id;
            let requeue = |reason: &str| {
                debug!(
                    message_id = %id,
                    attempt = entry.attempt,
                    reason = reason,
                    "Scheduling redelivery"
                );
                let _ = redelivery_tx.send(QueueEntry {
                    message: entry.message.clone(),
                    attempt: entry.attempt + 1,
                });
            };

            match tokio::time::timeout(visibility_timeout, disposition_rx).await {
                Ok(Ok(Disposition::Ack)) => {
                    let _ = ack_tx.send(AckEvent::Acknowledged(id));
                }
                Ok(Ok(Disposition::Nack)) => {
                    requeue("negative acknowledgment");
                }
                Ok(Ok(Disposition::DeadLetter(reason))) => {
                    dlq.push(entry.message.clone(), entry.attempt, &reason);
                    let _ = ack_tx.send(AckEvent::DeadLettered(id));
                }
                Ok(Err(_)) => {
                    requeue("handler dropped without disposition");
                }
                Err(_) => {
                    warn!(
                        message_id = %id,
                        attempt = entry.attempt,
                        timeout_ms = visibility_timeout.as_millis() as u64,
                        "Visibility timeout elapsed without acknowledgment"
                    );
                    requeue("visibility timeout elapsed");
                }
            }
        });
    }
}

/// All handles of an assembled in-process transport
pub struct InProcessTransport {
    pub binding: Arc<InProcessBinding>,
    pub inbound: Inbound,
    pub pump: DeliveryPump,
    pub ack_events: mpsc::UnboundedReceiver<AckEvent>,
}

impl InProcessTransport {
    pub fn new(
        config: &Config,
        dlq: Arc<DeadLetterQueue>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.transport_queue_capacity);
        let (redelivery_tx, redelivery_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(config.transport_queue_capacity);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let binding = Arc::new(InProcessBinding {
            name: config.binding_name.clone(),
            operation: config.binding_operation.clone(),
            queue: queue_tx,
        });

        let pump = DeliveryPump {
            queue_rx,
            redelivery_rx,
            redelivery_tx,
            out_tx,
            ack_tx,
            dlq,
            visibility_timeout: config.visibility_timeout,
            max_delivery_attempts: config.max_delivery_attempts,
            shutdown,
        };

        Self {
            binding,
            inbound: Inbound::new(out_rx),
            pump,
            ack_events: ack_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::BridgeMetrics;
    use std::time::Duration;

    fn test_config(queue_capacity: usize) -> Config {
        Config {
            port: 0,
            bind_address: "[::]:0".to_string(),
            binding_name: "busbinding".to_string(),
            binding_operation: "create".to_string(),
            send_interval: Duration::from_millis(10),
            max_send_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            backoff_ceiling: Duration::from_millis(100),
            transport_queue_capacity: queue_capacity,
            visibility_timeout: Duration::from_millis(100),
            max_delivery_attempts: 3,
            idempotency_retention: Duration::from_secs(3600),
            eviction_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(200),
            rust_log: "info".to_string(),
        }
    }

    fn assemble(queue_capacity: usize) -> (InProcessTransport, watch::Sender<bool>) {
        let metrics = Arc::new(BridgeMetrics::new().unwrap());
        let dlq = Arc::new(DeadLetterQueue::new(metrics));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = InProcessTransport::new(&test_config(queue_capacity), dlq, shutdown_rx);
        (transport, shutdown_tx)
    }

    fn message(id: u64) -> Message {
        Message::new(MessageId(id), b"0".to_vec())
    }

    #[tokio::test]
    async fn test_unknown_operation_is_terminal() {
        let (transport, _shutdown) = assemble(4);

        let err = transport
            .binding
            .invoke("delete", message(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Terminal(_)));
    }

    #[tokio::test]
    async fn test_full_queue_signals_saturation() {
        let (transport, _shutdown) = assemble(1);

        // Pump not running, so the first message fills the queue
        transport.binding.invoke("create", message(1)).await.unwrap();
        let err = transport
            .binding
            .invoke("create", message(2))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Saturated));
    }

    #[tokio::test]
    async fn test_ack_produces_ack_event() {
        let (mut transport, _shutdown) = assemble(4);
        tokio::spawn(transport.pump.run());

        transport.binding.invoke("create", message(7)).await.unwrap();

        let delivery = transport.inbound.recv().await.unwrap();
        assert_eq!(delivery.message.id, MessageId(7));
        assert_eq!(delivery.attempt, 1);
        delivery.ack();

        assert_eq!(
            transport.ack_events.recv().await,
            Some(AckEvent::Acknowledged(MessageId(7)))
        );
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_higher_attempt() {
        let (mut transport, _shutdown) = assemble(4);
        tokio::spawn(transport.pump.run());

        transport.binding.invoke("create", message(8)).await.unwrap();

        let first = transport.inbound.recv().await.unwrap();
        assert_eq!(first.attempt, 1);
        first.nack();

        let second = transport.inbound.recv().await.unwrap();
        assert_eq!(second.message.id, MessageId(8));
        assert_eq!(second.attempt, 2);
        second.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_ack_redelivers_after_visibility_timeout() {
        let (mut transport, _shutdown) = assemble(4);
        tokio::spawn(transport.pump.run());

        transport.binding.invoke("create", message(9)).await.unwrap();

        let first = transport.inbound.recv().await.unwrap();
        // Simulate a crashed handler: drop without any disposition
        drop(first);

        let second = transport.inbound.recv().await.unwrap();
        assert_eq!(second.message.id, MessageId(9));
        assert_eq!(second.attempt, 2);
        second.ack();
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let (mut transport, _shutdown) = assemble(4);
        let dlq = transport.pump.dlq.clone();
        tokio::spawn(transport.pump.run());

        transport.binding.invoke("create", message(10)).await.unwrap();

        // max_delivery_attempts = 3: nack all of them
        for attempt in 1..=3 {
            let delivery = transport.inbound.recv().await.unwrap();
            assert_eq!(delivery.attempt, attempt);
            delivery.nack();
        }

        assert_eq!(
            transport.ack_events.recv().await,
            Some(AckEvent::DeadLettered(MessageId(10)))
        );
        let entries = dlq.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_dead_letter_disposition_stops_redelivery() {
        let (mut transport, _shutdown) = assemble(4);
        let dlq = transport.pump.dlq.clone();
        tokio::spawn(transport.pump.run());

        transport.binding.invoke("create", message(11)).await.unwrap();

        let delivery = transport.inbound.recv().await.unwrap();
        delivery.dead_letter("payload decode failed");

        assert_eq!(
            transport.ack_events.recv().await,
            Some(AckEvent::DeadLettered(MessageId(11)))
        );
        let entries = dlq.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_reason, "payload decode failed");
        assert_eq!(entries[0].attempts, 1);
    }
}
