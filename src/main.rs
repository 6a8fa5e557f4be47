//! mokuro-online
//!
//! Main entry point: loads configuration, wires the cache/coalescer/
//! executor/renderer into shared state, and serves the `/v1` API.

use std::panic;
use std::sync::Arc;

use mokuro_online::api::{build_router, AppState};
use mokuro_online::config::Config;
use mokuro_online::render::DefaultRenderer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("mokuro-online fatal error:");
        eprintln!("{panic_info}");
        if let Some(location) = panic_info.location() {
            eprintln!("location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match mokuro_online::upload::sweep_stale_staged_files().await {
        Ok(removed) if removed > 0 => tracing::info!(removed, "swept stale staged upload files"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to sweep stale staged upload files"),
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error, refusing to start");
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = mokuro_online::VERSION,
        profile = ?config.profile,
        "starting mokuro-online"
    );

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, Arc::new(DefaultRenderer)).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
