use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use seatmap_api::{app, metrics::SeatMetrics, worker, AppState};
use seatmap_core::{EventBroadcaster, InMemorySeatStore, ReservationManager, ReservationPolicy, SeatInventoryStore, SystemClock};
use seatmap_store::{Config, PgSeatStore, RedisSeatStore, StoreBackend};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seatmap_api=debug,seatmap_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting seatmap on port {} ({:?} store)", config.server.port, config.store.backend);

    let store: Arc<dyn SeatInventoryStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemorySeatStore::new()),
        StoreBackend::Postgres => {
            let db = PgSeatStore::new(&config.database.url, config.database.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;
            Arc::new(db)
        }
        StoreBackend::Redis => Arc::new(
            RedisSeatStore::new(&config.redis.url)
                .await
                .context("Failed to connect to Redis")?,
        ),
    };

    let broadcaster = Arc::new(EventBroadcaster::with_capacity(
        config.broadcast.subscriber_queue_capacity,
    ));
    let manager = Arc::new(ReservationManager::new(
        store,
        broadcaster.clone(),
        Arc::new(SystemClock),
        ReservationPolicy {
            max_attempts: config.reservation.max_attempts,
            retry_backoff: config.reservation.retry_backoff(),
        },
    ));
    let metrics = Arc::new(SeatMetrics::new().context("Failed to register metrics")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reclaimer = worker::spawn_reclaimer(manager.clone(), &config.reclaimer, metrics.clone(), shutdown_rx);

    let app_state = AppState::new(manager, metrics, &config.reservation, &config.gateway);
    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open streams would otherwise hold the server up forever.
            broadcaster.close_all();
        })
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    reclaimer.await.context("Reclaimer task panicked")?;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
