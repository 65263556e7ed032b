//! modelgate-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables and validate it.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Select the inference backend and connect the record store and queue.
//! 4. Start the processor workers, the queue-size monitor and the periodic
//!    reconciliation loop.
//! 5. Build the Axum router and start the HTTP server with graceful
//!    shutdown; on the way out, optionally drain the queue.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use modelgate_core::backend::build_backend;
use modelgate_core::config::Config;
use modelgate_core::gateway::Gateway;
use modelgate_core::metrics::{LogSink, MetricsSink};
use modelgate_core::queue::{InMemoryQueue, RedisTaskQueue, TaskQueue};
use modelgate_core::record::HttpRecordStore;
use modelgate_core::{ReconcileEngine, TaskDistributor, TaskProcessor};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::AppState;

const QUEUE_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();
    cfg.validate().map_err(anyhow::Error::msg)?;

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: MG_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %cfg.environment,
        "modelgate-server starting"
    );

    // ── 3. Capabilities ────────────────────────────────────────────────────────
    let backend = build_backend(&cfg).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    info!(platform = ?cfg.ml_platform, "inference backend selected");

    let store = Arc::new(HttpRecordStore::new(&cfg));
    info!(address = %cfg.record_store_address, "record store ready");

    let queue: Arc<dyn TaskQueue> = if cfg.redis_url.is_empty() {
        warn!("MG_REDIS_URL not set, using the in-process queue");
        Arc::new(InMemoryQueue::new(cfg.max_queue_size))
    } else {
        let queue = RedisTaskQueue::connect(&cfg)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        info!(redis_url = %cfg.redis_url, "task queue connected");
        Arc::new(queue)
    };

    let metrics: Arc<dyn MetricsSink> = Arc::new(LogSink);
    let distributor = TaskDistributor::new(queue, &cfg);
    let gateway = Gateway::new(
        distributor.clone(),
        store.clone(),
        backend.clone(),
        metrics.clone(),
        &cfg,
    );
    let engine = Arc::new(ReconcileEngine::new(
        distributor.clone(),
        store.clone(),
        metrics.clone(),
        &cfg,
    ));

    // ── 4. Background work ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = TaskProcessor::new(
        distributor.clone(),
        store,
        backend,
        metrics.clone(),
        cfg.task_timeout(),
        cfg.worker_concurrency,
    );
    let workers = processor.spawn(shutdown_rx.clone());
    info!(concurrency = cfg.worker_concurrency, "processor workers started");

    tokio::spawn(monitor_queue_size(
        distributor.clone(),
        metrics,
        cfg.max_queue_size,
        shutdown_rx.clone(),
    ));

    if cfg.enable_periodic_check {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.periodic_check(shutdown).await });
        info!("periodic reconciliation enabled");
    }

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState {
        gateway,
        distributor,
    });
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the workers before touching the queue so the drain does not race
    // a claim.
    let _ = shutdown_tx.send(true);
    for handle in workers {
        let _ = handle.await;
    }
    if cfg.shutdown_delay > 0 {
        info!(seconds = cfg.shutdown_delay, "delaying shutdown drain");
        tokio::time::sleep(Duration::from_secs(cfg.shutdown_delay)).await;
    }
    engine.shutdown_drain().await;

    info!("modelgate-server stopped");
    Ok(())
}

/// Report queue pressure on a fixed interval until shutdown.
async fn monitor_queue_size(
    distributor: TaskDistributor,
    metrics: Arc<dyn MetricsSink>,
    max_queue_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let size = distributor.queue_size().await.unwrap_or(0);
        metrics.set_queue_size(size, size as f64 / max_queue_size as f64);
        tokio::select! {
            _ = tokio::time::sleep(QUEUE_MONITOR_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
