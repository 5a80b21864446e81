use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use maestro_server::{build_router, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,maestro_runtime=info,maestro_server=info")),
        )
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();
    let tick_interval = config.scheduler_background_interval;
    let state = AppState::build(config)?;

    let cancel = CancellationToken::new();
    let mut background = Vec::new();
    if tick_interval > 0.0 {
        let interval = Duration::from_secs_f64(tick_interval);
        background.push(tokio::spawn(
            Arc::clone(&state.scheduler).run_background(interval, cancel.clone()),
        ));
        background.push(tokio::spawn(
            Arc::clone(&state.lease).run_expire_loop(interval, cancel.clone()),
        ));
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("maestro control plane listening on http://{bind_addr}");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    for task in background {
        let _ = task.await;
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
