// =============================================================================
// Context Engine: main entry point
// =============================================================================
//
// Startup is non-blocking: the engine returns in milliseconds while the
// historical backfill runs in the background and the live stream feeds the
// accumulator. The HTTP surface is read-only.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod backfill;
mod binance;
mod config;
mod context;
mod engine;
mod errors;
mod history;
mod live;
mod quantize;
mod types;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine::ContextEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Context Engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    // ── 2. Engine (non-blocking startup) ─────────────────────────────────
    let engine = ContextEngine::start(config).await?;

    // ── 3. API server ────────────────────────────────────────────────────
    let app = api::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 4. Run until Ctrl+C or an engine-fatal condition ─────────────────
    let mut engine_down = engine.shutdown_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
        }
        _ = engine_down.changed() => {
            error!("engine requested termination");
        }
    }

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    engine.shutdown().await;
    server.abort();

    info!("context engine shut down complete");
    Ok(())
}
