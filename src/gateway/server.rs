// =============================================================================
// Gateway HTTP surface — Axum 0.7
// =============================================================================
//
// `/ws` upgrades into the tick stream; `/healthz` and `/api/symbols` serve
// the supervisor probe and the renderer's initial HTTP fetch. CORS is
// permissive: the gateway sits behind a trusted proxy and performs no
// per-client authentication.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::app_state::AppState;
use crate::gateway::protocol::SymbolListEntry;
use crate::gateway::session::handle_socket;

/// Build the gateway router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/symbols", get(symbols))
        .layer(cors)
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if *state.shutdown.borrow() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    debug!("websocket upgrade accepted");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_snapshot())
}

#[derive(Serialize)]
struct SymbolsResponse {
    symbols: Vec<SymbolListEntry>,
}

/// REST mirror of the WebSocket `symbolList` hello.
async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(SymbolsResponse {
        symbols: state.symbol_entries(),
    })
}
