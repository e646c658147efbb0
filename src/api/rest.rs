// =============================================================================
// REST API endpoints (Axum 0.7)
// =============================================================================
//
// Every route is a thin, read-only projection over the engine's snapshot
// builders; nothing here mutates state. CORS is configured permissively so
// local dashboards and strategy processes can read without ceremony.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::context::VwapMode;
use crate::engine::ContextEngine;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full read-only router with CORS middleware and shared state.
pub fn router(engine: Arc<ContextEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/context", get(context))
        .route("/backfill/status", get(backfill_status))
        .route("/debug/vwap", get(debug_vwap))
        .route("/debug/poc", get(debug_poc))
        .route("/debug/trades", get(debug_trades))
        .route("/debug/exchangeinfo", get(debug_exchange_info))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(engine): State<Arc<ContextEngine>>) -> impl IntoResponse {
    Json(engine.health())
}

async fn ready(State(engine): State<Arc<ContextEngine>>) -> impl IntoResponse {
    Json(engine.ready())
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    #[serde(default)]
    vwap_mode: Option<String>,
}

async fn context(
    State(engine): State<Arc<ContextEngine>>,
    Query(query): Query<ContextQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = match query.vwap_mode.as_deref() {
        None => VwapMode::Base,
        Some(raw) => VwapMode::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("invalid vwap_mode: '{raw}'; use 'base' or 'quote'"),
                })),
            )
        })?,
    };

    Ok(Json(engine.context_snapshot(mode)))
}

async fn backfill_status(State(engine): State<Arc<ContextEngine>>) -> impl IntoResponse {
    Json(engine.backfill_status())
}

async fn debug_vwap(State(engine): State<Arc<ContextEngine>>) -> impl IntoResponse {
    Json(engine.debug_vwap())
}

async fn debug_poc(State(engine): State<Arc<ContextEngine>>) -> impl IntoResponse {
    Json(engine.debug_poc())
}

async fn debug_trades(State(engine): State<Arc<ContextEngine>>) -> impl IntoResponse {
    Json(engine.debug_trades())
}

async fn debug_exchange_info(State(engine): State<Arc<ContextEngine>>) -> impl IntoResponse {
    Json(engine.debug_exchange_info())
}
