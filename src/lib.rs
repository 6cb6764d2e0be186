// ============================================================================
// bus-bridge
// ============================================================================
//
// Reliable at-least-once message delivery bridge: a periodic producer
// submits counter messages through a transport binding; the receiver
// processes them effectively exactly-once behind an idempotency store and
// acknowledges over HTTP. Messages that exhaust policy limits are
// dead-lettered, never silently dropped.
//
// ============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod backoff;
pub mod channel;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod idempotency;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod receiver;
pub mod transport;

use channel::DeliveryChannel;
use config::Config;
use dead_letter::DeadLetterQueue;
use idempotency::{EvictionTask, InMemoryIdempotencyStore};
use metrics::BridgeMetrics;
use producer::ProducerLoop;
use receiver::routes::{create_router, HttpState};
use receiver::{LogEffect, ReceiverService, ReceiverWorker};
use transport::InProcessTransport;

pub async fn run() -> Result<()> {
    // Load configuration first (needed for logging)
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let instance_id = uuid::Uuid::new_v4().to_string();
    info!(
        instance_id = %instance_id,
        binding = %config.binding_name,
        send_interval_ms = config.send_interval.as_millis() as u64,
        "bus-bridge starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(BridgeMetrics::new().context("Failed to register metrics")?);
    let dlq = Arc::new(DeadLetterQueue::new(metrics.clone()));
    let store = Arc::new(InMemoryIdempotencyStore::new());

    // Transport: in-process binding honoring the external transport contract
    let transport = InProcessTransport::new(&config, dlq.clone(), shutdown_rx.clone());
    let InProcessTransport {
        binding,
        inbound,
        pump,
        ack_events,
    } = transport;

    let channel = Arc::new(DeliveryChannel::new(
        binding,
        inbound,
        &config,
        dlq.clone(),
        metrics.clone(),
    ));

    // Bind the listener before spawning anything: an unusable socket is an
    // unrecoverable startup failure and must exit non-zero
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!("bus-bridge listening on {}", config.bind_address);

    let pump_handle = tokio::spawn(pump.run());
    tokio::spawn(channel::run_ack_keeper(
        channel.clone(),
        ack_events,
        shutdown_rx.clone(),
    ));
    tokio::spawn(
        EvictionTask::new(
            store.clone(),
            config.idempotency_retention,
            config.eviction_interval,
            metrics.clone(),
            shutdown_rx.clone(),
        )
        .run(),
    );

    let service = Arc::new(ReceiverService::new(
        store,
        Arc::new(LogEffect),
        metrics.clone(),
    ));
    let worker = ReceiverWorker::new(
        channel.clone(),
        service.clone(),
        shutdown_rx.clone(),
        config.shutdown_grace,
    );
    let worker_handle = tokio::spawn(worker.run());

    let producer = ProducerLoop::new(channel.clone(), &config, shutdown_rx.clone());
    let producer_handle = tokio::spawn(producer.run());

    let http_state = Arc::new(HttpState {
        service,
        dlq,
        metrics,
    });
    let app = create_router(&config.binding_route(), http_state);
    let mut http_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = http_shutdown.changed().await;
    });
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received; draining...");
    let _ = shutdown_tx.send(true);

    let drain = async {
        if let Ok(produced) = producer_handle.await {
            info!(produced = produced, "Producer drained");
        }
        let _ = worker_handle.await;
        let _ = pump_handle.await;
        let _ = server_handle.await;
    };
    // Components enforce the grace period themselves; this outer timeout is
    // the hard stop
    let hard_stop = config.shutdown_grace + std::time::Duration::from_secs(2);
    if tokio::time::timeout(hard_stop, drain).await.is_err() {
        warn!("Drain did not complete within grace period; exiting anyway");
    }

    info!("bus-bridge stopped");
    Ok(())
}

/// Resolve on SIGTERM or Ctrl-C
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received");
    }
}
