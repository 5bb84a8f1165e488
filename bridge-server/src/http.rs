//! HTTP ingress.
//!
//! `POST /` accepts one trade event per request. Accepted and deduplicated
//! events both answer success so the upstream EA never retries; only
//! malformed JSON earns a 400. `GET /health` reports per-account session
//! state.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::accounts::AccountRegistry;
use crate::dedup::DedupFilter;
use crate::events::TradeEvent;
use crate::router::EventRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<EventRouter>,
    pub dedup: Arc<DedupFilter>,
    pub registry: Arc<AccountRegistry>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(ingest_event))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ingest_event(State(state): State<AppState>, body: String) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Invalid JSON received: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "message": "Invalid JSON" })),
            )
                .into_response();
        }
    };

    let event = match TradeEvent::from_json(&value) {
        Ok(event) => event,
        Err(e) => {
            // Still success: the upstream must not retry unprocessable events.
            tracing::warn!("Ignoring unprocessable trade event: {}", e);
            return success();
        }
    };

    tracing::info!(
        "Received trade event: {} for ticket {}",
        event.kind,
        event.ticket
    );

    if state.dedup.should_drop(event.kind, event.ticket, &event.symbol) {
        tracing::info!(
            "Dropped duplicate trade event: {} ticket={} symbol={}",
            event.kind,
            event.ticket,
            event.symbol
        );
        return success();
    }

    state.router.route(&event).await;
    success()
}

fn success() -> Response {
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "message": "Trade event processed" })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut accounts = serde_json::Map::new();
    for account in state.registry.accounts() {
        accounts.insert(
            account.name().to_string(),
            json!({
                "account_id": account.config.account_id,
                "enabled": account.config.enabled,
                "connected": account.session.is_ready().await,
                "phase": format!("{:?}", account.session.phase().await),
                "daily_trades": account.daily_trades(),
                "open_positions": account.correlation.open_position_count().await,
            }),
        );
    }

    Json(json!({
        "status": "ok",
        "service": "MT5 to cTrader Bridge",
        "accounts": accounts,
    }))
}
