use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use transcribe_relay::config::Config;
use transcribe_relay::gateway::{self, AppState, HeaderAuthProvider};
use transcribe_relay::queue::DurableWriteQueue;
use transcribe_relay::quota::QuotaService;
use transcribe_relay::store::PgStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| {
        eprintln!("configuration error: {e}");
        e
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let store: Arc<dyn transcribe_relay::store::Store> = Arc::new(PgStore::new(pool));
    let quota = Arc::new(QuotaService::new(store.clone()));

    // Separate from axum's own graceful-shutdown future: the dispatcher must
    // keep polling the heap until `flush()` below has observed it empty, so
    // this token is only cancelled *after* the queue has drained, not when
    // the shutdown signal first arrives.
    let dispatcher_shutdown = CancellationToken::new();
    let write_queue = DurableWriteQueue::spawn(
        store.clone(),
        dispatcher_shutdown.clone(),
        config.write_queue_max_concurrency,
        config.write_queue_max_retries,
    );

    let config = Arc::new(config);
    let state = Arc::new(AppState::new(
        config.clone(),
        quota,
        write_queue.clone(),
        store,
        Arc::new(HeaderAuthProvider),
    ));

    let app = Router::new().route("/ws", get(gateway::upgrade)).with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_socket_addr()).await?;
    tracing::info!(addr = %config.listen_socket_addr(), "transcribe-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received, no longer accepting new connections");
        })
        .await?;

    // All sessions have finished (and enqueued their priority-10 finalization
    // writes) by the time `serve` returns; the dispatcher is still running,
    // so `flush()` can actually observe the heap and in-flight set drain.
    tracing::info!("connections drained, flushing write queue");
    write_queue.flush().await;
    dispatcher_shutdown.cancel();
    tracing::info!("write queue drained, exiting");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
