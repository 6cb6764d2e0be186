// ============================================================================
// Receiver Service
// ============================================================================
//
// Processes inbound messages exactly once from the caller's perspective
// despite at-least-once transport delivery:
//
// 1. decode the payload (JSON integer); poison payloads are dead-lettered
//    immediately, never redelivered
// 2. claim the id in the idempotency store; losers of the claim race and
//    already-processed ids are acknowledged as duplicates without
//    reprocessing
// 3. apply the application effect
// 4. commit the claim - only after effect success, so a failed effect
//    releases the claim and the transport's redelivery gets a real retry
// 5. acknowledge with "CID{n}"
//
// A store failure degrades processing to at-least-once for the affected
// message (logged, counted), it never blocks delivery.
//
// ============================================================================

pub mod routes;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channel::DeliveryChannel;
use crate::error::ReceiveError;
use crate::idempotency::{ClaimOutcome, IdempotencyStore};
use crate::message::Message;
use crate::metrics::BridgeMetrics;
use crate::transport::Delivery;

/// Acknowledgment returned to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub body: String,
}

/// The application-specific side effect applied to each message
#[async_trait]
pub trait MessageEffect: Send + Sync {
    async fn apply(&self, order_id: i64, message: &Message) -> anyhow::Result<()>;
}

/// Default effect: log the received counter
pub struct LogEffect;

#[async_trait]
impl MessageEffect for LogEffect {
    async fn apply(&self, order_id: i64, message: &Message) -> anyhow::Result<()> {
        info!(message_id = %message.id, order_id = order_id, "Received message");
        Ok(())
    }
}

pub struct ReceiverService {
    store: Arc<dyn IdempotencyStore>,
    effect: Arc<dyn MessageEffect>,
    metrics: Arc<BridgeMetrics>,
}

impl ReceiverService {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        effect: Arc<dyn MessageEffect>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            store,
            effect,
            metrics,
        }
    }

    pub async fn on_message(&self, message: &Message) -> Result<Ack, ReceiveError> {
        let order_id: i64 = serde_json::from_slice(&message.payload)
            .map_err(|e| ReceiveError::Decode(e.to_string()))?;
        let ack = Ack {
            body: format!("CID{}", order_id),
        };

        // None = store unavailable; proceed without suppression (at-least-once)
        let claim = match self.store.claim(message.id).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    error = %e,
                    "Idempotency store unavailable; processing without duplicate suppression"
                );
                self.metrics.store_degraded.inc();
                None
            }
        };

        match claim {
            Some(ClaimOutcome::AlreadyProcessed) | Some(ClaimOutcome::InFlight) => {
                debug!(message_id = %message.id, "Duplicate delivery suppressed");
                self.metrics.duplicates_suppressed.inc();
                return Ok(ack);
            }
            Some(ClaimOutcome::Claimed) | None => {}
        }
        let claimed = claim == Some(ClaimOutcome::Claimed);

        if let Err(effect_err) = self.effect.apply(order_id, message).await {
            if claimed {
                // Let the transport's redelivery retry this id
                if let Err(e) = self.store.release(message.id).await {
                    warn!(message_id = %message.id, error = %e, "Failed to release claim");
                }
            }
            return Err(ReceiveError::Effect(effect_err.to_string()));
        }

        if claimed {
            if let Err(e) = self.store.commit(message.id, Utc::now()).await {
                warn!(
                    message_id = %message.id,
                    error = %e,
                    "Failed to commit idempotency entry; a redelivery may reapply the effect"
                );
                self.metrics.store_degraded.inc();
            }
        }

        self.metrics.messages_delivered.inc();
        debug!(message_id = %message.id, order_id = order_id, "Message processed");
        Ok(ack)
    }
}

/// Consumes the delivery channel and runs one handler task per message
pub struct ReceiverWorker {
    channel: Arc<DeliveryChannel>,
    service: Arc<ReceiverService>,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
}

impl ReceiverWorker {
    pub fn new(
        channel: Arc<DeliveryChannel>,
        service: Arc<ReceiverService>,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> Self {
        Self {
            channel,
            service,
            shutdown,
            grace,
        }
    }

    pub async fn run(mut self) {
        info!("Receiver worker started");
        let mut handlers: JoinSet<()> = JoinSet::new();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.changed() => break,
                maybe = self.channel.recv() => {
                    let Some(delivery) = maybe else {
                        info!("Transport closed; receiver worker stopping");
                        break;
                    };
                    let service = self.service.clone();
                    handlers.spawn(handle_delivery(service, delivery));
                }
            }

            // Reap finished handlers so the set stays small
            while let Some(result) = handlers.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Message handler panicked");
                }
            }
        }

        // Stop accepting, drain in-flight handlers up to the grace period
        let in_flight = handlers.len();
        if in_flight > 0 {
            info!(in_flight = in_flight, "Draining in-flight handlers");
        }
        let drain = async {
            while let Some(result) = handlers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Message handler panicked");
                }
            }
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!(
                grace_ms = self.grace.as_millis() as u64,
                "Handlers did not drain within grace period; forcing exit"
            );
            handlers.abort_all();
        }

        info!("Receiver worker stopped");
    }
}

async fn handle_delivery(service: Arc<ReceiverService>, delivery: Delivery) {
    match service.on_message(&delivery.message).await {
        Ok(_ack) => delivery.ack(),
        Err(ReceiveError::Decode(reason)) => {
            // Poison message: terminal on first attempt. The pump records it
            // in the DLQ and acknowledges so it is never redelivered.
            delivery.dead_letter(format!("payload decode failed: {}", reason));
        }
        Err(err @ ReceiveError::Effect(_)) => {
            err.log();
            // Withhold the acknowledgment; the transport redelivers and
            // dead-letters after the attempt limit
            delivery.nack();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::message::MessageId;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct CountingEffect {
        applied: AtomicU64,
        fail: AtomicBool,
    }

    impl CountingEffect {
        fn new() -> Self {
            Self {
                applied: AtomicU64::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MessageEffect for CountingEffect {
        async fn apply(&self, _order_id: i64, _message: &Message) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("effect unavailable");
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Store that always fails, for degraded-mode tests
    struct BrokenStore;

    #[async_trait]
    impl IdempotencyStore for BrokenStore {
        async fn has(&self, _id: MessageId) -> Result<bool, StoreError> {
            Err(StoreError("store offline".to_string()))
        }
        async fn claim(&self, _id: MessageId) -> Result<ClaimOutcome, StoreError> {
            Err(StoreError("store offline".to_string()))
        }
        async fn commit(&self, _id: MessageId, _at: DateTime<Utc>) -> Result<(), StoreError> {
            Err(StoreError("store offline".to_string()))
        }
        async fn release(&self, _id: MessageId) -> Result<(), StoreError> {
            Err(StoreError("store offline".to_string()))
        }
        async fn evict_older_than(&self, _window: Duration) -> Result<usize, StoreError> {
            Err(StoreError("store offline".to_string()))
        }
        async fn count(&self) -> Result<usize, StoreError> {
            Err(StoreError("store offline".to_string()))
        }
    }

    fn service_with(
        store: Arc<dyn IdempotencyStore>,
    ) -> (Arc<ReceiverService>, Arc<CountingEffect>, Arc<BridgeMetrics>) {
        let metrics = Arc::new(BridgeMetrics::new().unwrap());
        let effect = Arc::new(CountingEffect::new());
        let service = Arc::new(ReceiverService::new(store, effect.clone(), metrics.clone()));
        (service, effect, metrics)
    }

    fn message(id: u64, payload: &[u8]) -> Message {
        Message::new(MessageId(id), payload.to_vec())
    }

    #[tokio::test]
    async fn test_round_trip_ack_body() {
        let (service, effect, _metrics) =
            service_with(Arc::new(InMemoryIdempotencyStore::new()));

        let ack = service.on_message(&message(0, b"0")).await.unwrap();

        assert_eq!(ack.body, "CID0");
        assert_eq!(effect.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_produces_one_effect_two_acks() {
        let (service, effect, metrics) =
            service_with(Arc::new(InMemoryIdempotencyStore::new()));
        let msg = message(1, b"1");

        let first = service.on_message(&msg).await.unwrap();
        let second = service.on_message(&msg).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(effect.applied.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.duplicates_suppressed.get(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_reported() {
        let (service, effect, _metrics) =
            service_with(Arc::new(InMemoryIdempotencyStore::new()));

        let err = service
            .on_message(&message(2, b"not a number"))
            .await
            .unwrap_err();

        assert!(matches!(err, ReceiveError::Decode(_)));
        assert_eq!(effect.applied.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_effect_failure_releases_claim_for_redelivery() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let (service, effect, _metrics) = service_with(store.clone());
        let msg = message(3, b"3");

        effect.fail.store(true, Ordering::SeqCst);
        let err = service.on_message(&msg).await.unwrap_err();
        assert!(matches!(err, ReceiveError::Effect(_)));
        assert!(!store.has(MessageId(3)).await.unwrap());

        // Redelivery succeeds once the effect recovers
        effect.fail.store(false, Ordering::SeqCst);
        let ack = service.on_message(&msg).await.unwrap();
        assert_eq!(ack.body, "CID3");
        assert_eq!(effect.applied.load(Ordering::SeqCst), 1);
        assert!(store.has(MessageId(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_at_least_once() {
        let (service, effect, metrics) = service_with(Arc::new(BrokenStore));
        let msg = message(4, b"4");

        // Both deliveries apply the effect: duplicates are possible but
        // nothing is lost
        service.on_message(&msg).await.unwrap();
        service.on_message(&msg).await.unwrap();

        assert_eq!(effect.applied.load(Ordering::SeqCst), 2);
        assert!(metrics.store_degraded.get() >= 2);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_single_effect() {
        let (service, effect, _metrics) =
            service_with(Arc::new(InMemoryIdempotencyStore::new()));
        let msg = message(5, b"5");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            let msg = msg.clone();
            handles.push(tokio::spawn(async move {
                service.on_message(&msg).await.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().body, "CID5");
        }
        assert_eq!(effect.applied.load(Ordering::SeqCst), 1);
    }
}
