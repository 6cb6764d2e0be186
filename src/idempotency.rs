// ============================================================================
// Idempotency Store
// ============================================================================
//
// Tracks which message ids have already been processed so redeliveries can
// be collapsed. The transport redelivers whenever an acknowledgment is lost,
// so the receiver MUST consult this store before applying effects.
//
// Two-phase protocol:
//   claim(id)   - atomic check-and-reserve; exactly one concurrent caller
//                 per id wins and proceeds to apply the effect
//   commit(id)  - called only after the effect succeeded; converts the
//                 claim into a processed entry
//   release(id) - called when the effect failed; drops the claim so a
//                 transport redelivery can retry
//
// Committing after the effect means a crash between effect and commit yields
// a duplicate effect on redelivery, never a lost message: at-least-once.
//
// ============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::message::MessageId;
use crate::metrics::BridgeMetrics;

/// Outcome of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller holds the claim and must apply the effect, then commit or release
    Claimed,
    /// Another handler holds an uncommitted claim for this id; treat as duplicate
    InFlight,
    /// Already processed; treat as duplicate
    AlreadyProcessed,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether the id was already recorded as processed
    async fn has(&self, id: MessageId) -> Result<bool, StoreError>;

    /// Atomically reserve the id for processing
    async fn claim(&self, id: MessageId) -> Result<ClaimOutcome, StoreError>;

    /// Record the id as processed. Recording an already-processed id is a
    /// no-op after the first commit.
    async fn commit(&self, id: MessageId, processed_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Drop an uncommitted claim
    async fn release(&self, id: MessageId) -> Result<(), StoreError>;

    /// Remove processed entries older than the window, returning the count
    async fn evict_older_than(&self, window: Duration) -> Result<usize, StoreError>;

    /// Number of entries currently held (claims included), for monitoring
    async fn count(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Copy)]
enum EntryState {
    InFlight,
    Processed(DateTime<Utc>),
}

/// In-memory store. Redelivery bookkeeping only survives the process, which
/// matches the in-process transport it pairs with.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<MessageId, EntryState>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<MessageId, EntryState>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError("store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has(&self, id: MessageId) -> Result<bool, StoreError> {
        let entries = self.lock()?;
        Ok(matches!(entries.get(&id), Some(EntryState::Processed(_))))
    }

    async fn claim(&self, id: MessageId) -> Result<ClaimOutcome, StoreError> {
        let mut entries = self.lock()?;
        match entries.get(&id) {
            Some(EntryState::Processed(_)) => Ok(ClaimOutcome::AlreadyProcessed),
            Some(EntryState::InFlight) => Ok(ClaimOutcome::InFlight),
            None => {
                entries.insert(id, EntryState::InFlight);
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn commit(&self, id: MessageId, processed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        match entries.get(&id) {
            // First commit wins; later commits of the same id are no-ops
            Some(EntryState::Processed(_)) => {}
            _ => {
                entries.insert(id, EntryState::Processed(processed_at));
            }
        }
        Ok(())
    }

    async fn release(&self, id: MessageId) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        if matches!(entries.get(&id), Some(EntryState::InFlight)) {
            entries.remove(&id);
        }
        Ok(())
    }

    async fn evict_older_than(&self, window: Duration) -> Result<usize, StoreError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| StoreError(format!("retention window out of range: {}", e)))?;
        let cutoff = Utc::now() - window;

        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, state| match state {
            EntryState::InFlight => true,
            EntryState::Processed(at) => *at >= cutoff,
        });

        Ok(before - entries.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }
}

/// Background task that periodically evicts entries past the retention
/// window, keeping the store bounded.
pub struct EvictionTask {
    store: Arc<dyn IdempotencyStore>,
    retention: Duration,
    interval: Duration,
    metrics: Arc<BridgeMetrics>,
    shutdown: watch::Receiver<bool>,
}

impl EvictionTask {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        retention: Duration,
        interval: Duration,
        metrics: Arc<BridgeMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            retention,
            interval,
            metrics,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Starting idempotency eviction task"
        );

        let mut interval = time::interval(self.interval);
        interval.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("Eviction task stopping");
                    break;
                }
                _ = interval.tick() => {}
            }

            match self.store.evict_older_than(self.retention).await {
                Ok(0) => {
                    debug!("No idempotency entries to evict");
                }
                Ok(evicted) => {
                    self.metrics.idempotency_evicted.inc_by(evicted as u64);
                    info!(evicted = evicted, "Evicted expired idempotency entries");
                }
                Err(e) => {
                    error!(error = %e, "Failed to evict idempotency entries");
                }
            }

            if let Ok(count) = self.store.count().await {
                debug!(entries = count, "Idempotency store size");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_commit_flow() {
        let store = InMemoryIdempotencyStore::new();
        let id = MessageId(1);

        assert!(!store.has(id).await.unwrap());
        assert_eq!(store.claim(id).await.unwrap(), ClaimOutcome::Claimed);

        // Uncommitted claim is not "processed" yet
        assert!(!store.has(id).await.unwrap());
        assert_eq!(store.claim(id).await.unwrap(), ClaimOutcome::InFlight);

        store.commit(id, Utc::now()).await.unwrap();
        assert!(store.has(id).await.unwrap());
        assert_eq!(
            store.claim(id).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_release_allows_retry() {
        let store = InMemoryIdempotencyStore::new();
        let id = MessageId(2);

        assert_eq!(store.claim(id).await.unwrap(), ClaimOutcome::Claimed);
        store.release(id).await.unwrap();

        // A redelivery can claim again after a failed effect
        assert_eq!(store.claim(id).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = InMemoryIdempotencyStore::new();
        let id = MessageId(3);

        let first = Utc::now() - chrono::Duration::hours(1);
        store.commit(id, first).await.unwrap();
        store.commit(id, Utc::now()).await.unwrap();

        // The original timestamp survives, so eviction uses first-processing time
        let evicted = store
            .evict_older_than(Duration::from_secs(30 * 60))
            .await
            .unwrap();
        assert_eq!(evicted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let id = MessageId(4);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim(id).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimOutcome::Claimed {
                winners += 1;
            }
        }

        assert_eq!(winners, 1, "exactly one concurrent claim must win");
    }

    #[tokio::test]
    async fn test_eviction_respects_window() {
        let store = InMemoryIdempotencyStore::new();

        store
            .commit(MessageId(1), Utc::now() - chrono::Duration::hours(25))
            .await
            .unwrap();
        store.commit(MessageId(2), Utc::now()).await.unwrap();
        store.claim(MessageId(3)).await.unwrap();

        let evicted = store
            .evict_older_than(Duration::from_secs(24 * 3600))
            .await
            .unwrap();

        assert_eq!(evicted, 1);
        assert!(!store.has(MessageId(1)).await.unwrap());
        assert!(store.has(MessageId(2)).await.unwrap());
        // In-flight claims are never evicted
        assert_eq!(store.count().await.unwrap(), 2);
    }
}
