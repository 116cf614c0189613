//! HTTP API for health checks and order book queries

mod query;

pub use query::{apply_query, QueryLimits};

use crate::config::ApiConfig;
use crate::error::{NodeError, NodeResult};
use crate::ledger::ChainId;
use crate::state::SharedState;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub core: SharedState,
    pub base: ChainId,
    pub quote: ChainId,
    pub limits: Arc<QueryLimits>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    core: SharedState,
    base: ChainId,
    quote: ChainId,
) -> NodeResult<()> {
    let state = AppState {
        core,
        base,
        quote,
        limits: Arc::new(QueryLimits {
            default_page_limit: config.default_page_limit,
            max_page_limit: config.max_page_limit,
            max_filter_fields: config.max_filter_fields,
        }),
    };

    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(NodeError::SnapshotIo)?;
    axum::serve(listener, app).await.map_err(NodeError::SnapshotIo)?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/market", get(get_market))
        .route("/bids", get(get_bids))
        .route("/asks", get(get_asks))
        .route("/orders", get(get_orders))
        .route("/pending-transfers", get(get_pending_transfers))
        .with_state(state)
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Market summary: the chain pair and current depth
async fn get_market(State(state): State<AppState>) -> impl IntoResponse {
    let core = state.core.lock().await;
    Json(MarketResponse {
        base_chain: state.base.to_string(),
        quote_chain: state.quote.to_string(),
        bid_count: core.book.bid_count(),
        ask_count: core.book.ask_count(),
        best_bid_price: core.book.best_bid_price().map(|p| p.to_string()),
        best_ask_price: core.book.best_ask_price().map(|p| p.to_string()),
        pending_transfer_count: core.registry.len(),
    })
}

async fn get_bids(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let items = {
        let core = state.core.lock().await;
        core.book
            .bid_orders()
            .map(|o| serde_json::to_value(o).unwrap_or(Value::Null))
            .collect()
    };
    respond(apply_query(items, &params, &state.limits))
}

async fn get_asks(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let items = {
        let core = state.core.lock().await;
        core.book
            .ask_orders()
            .map(|o| serde_json::to_value(o).unwrap_or(Value::Null))
            .collect()
    };
    respond(apply_query(items, &params, &state.limits))
}

async fn get_orders(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let items = {
        let core = state.core.lock().await;
        core.book
            .open_orders()
            .map(|o| serde_json::to_value(o).unwrap_or(Value::Null))
            .collect()
    };
    respond(apply_query(items, &params, &state.limits))
}

async fn get_pending_transfers(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let items = {
        let core = state.core.lock().await;
        core.registry
            .values()
            .map(|entry| {
                let mut contributors: Vec<&String> = entry.contributors.iter().collect();
                contributors.sort();
                json!({
                    "id": entry.transaction.id,
                    "target_chain": entry.target_chain,
                    "recipient": entry.transaction.recipient,
                    "amount": entry.transaction.amount,
                    "timestamp": entry.transaction.timestamp,
                    "height": entry.transaction.height,
                    "memo": entry.transaction.memo,
                    "signature_count": entry.transaction.signatures.len(),
                    "contributors": contributors,
                    "creation_height": entry.creation_height,
                    "inserted_at": entry.inserted_at,
                    "is_ready": entry.is_ready,
                })
            })
            .collect()
    };
    respond(apply_query(items, &params, &state.limits))
}

fn respond(result: NodeResult<Vec<Value>>) -> axum::response::Response {
    match result {
        Ok(items) => (StatusCode::OK, Json(items)).into_response(),
        Err(NodeError::InvalidQuery(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": { "kind": "InvalidQueryError", "message": message }
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": { "kind": "InternalError", "message": e.to_string() }
            })),
        )
            .into_response(),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct MarketResponse {
    base_chain: String,
    quote_chain: String,
    bid_count: usize,
    ask_count: usize,
    best_bid_price: Option<String>,
    best_ask_price: Option<String>,
    pending_transfer_count: usize,
}
