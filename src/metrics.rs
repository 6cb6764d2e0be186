use anyhow::Result;
use prometheus::{opts, Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

/// Observability handle for the bridge.
///
/// Owns its own registry and is passed explicitly into every component, so
/// nothing in the crate depends on the process-global default registry.
pub struct BridgeMetrics {
    registry: Registry,

    pub messages_sent: IntCounter,
    pub send_failures: IntCounter,
    pub messages_delivered: IntCounter,
    pub duplicates_suppressed: IntCounter,
    pub dead_lettered: IntCounter,
    pub idempotency_evicted: IntCounter,
    pub store_degraded: IntCounter,
    pub send_latency: Histogram,
}

impl BridgeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_sent = IntCounter::with_opts(opts!(
            "bridge_messages_sent_total",
            "Messages accepted by the transport"
        ))?;
        let send_failures = IntCounter::with_opts(opts!(
            "bridge_send_failures_total",
            "Failed send attempts (transient, saturated and terminal)"
        ))?;
        let messages_delivered = IntCounter::with_opts(opts!(
            "bridge_messages_delivered_total",
            "Messages processed by the receiver (first delivery only)"
        ))?;
        let duplicates_suppressed = IntCounter::with_opts(opts!(
            "bridge_duplicates_suppressed_total",
            "Redelivered messages collapsed by the idempotency store"
        ))?;
        let dead_lettered = IntCounter::with_opts(opts!(
            "bridge_dead_lettered_total",
            "Messages moved to the dead-letter queue"
        ))?;
        let idempotency_evicted = IntCounter::with_opts(opts!(
            "bridge_idempotency_evicted_total",
            "Idempotency entries evicted after the retention window"
        ))?;
        let store_degraded = IntCounter::with_opts(opts!(
            "bridge_store_degraded_total",
            "Messages processed without duplicate suppression due to store errors"
        ))?;
        let send_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bridge_send_latency_seconds",
                "Send latency including in-channel retries",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(messages_delivered.clone()))?;
        registry.register(Box::new(duplicates_suppressed.clone()))?;
        registry.register(Box::new(dead_lettered.clone()))?;
        registry.register(Box::new(idempotency_evicted.clone()))?;
        registry.register(Box::new(store_degraded.clone()))?;
        registry.register(Box::new(send_latency.clone()))?;

        Ok(Self {
            registry,
            messages_sent,
            send_failures,
            messages_delivered,
            duplicates_suppressed,
            dead_lettered,
            idempotency_evicted,
            store_degraded,
            send_latency,
        })
    }

    /// Encode all metrics in the Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}
