mod handlers;
mod monitor;
mod state;

use crate::state::AppState;
use std::{env, time::Duration};
use tokio::net::TcpListener;
use tracing::info;

pub const WORKER_DEAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

fn bind_addr() -> String {
    env::var("MASTER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("master=debug,tower_http=info,axum=info")
        .init();

    let state = AppState::new();

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_workers(monitor_state).await;
    });

    let listener = TcpListener::bind(bind_addr()).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await
}
