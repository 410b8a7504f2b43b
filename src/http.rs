//! REST endpoints — stats, the order ledger, accounts, knowledge search,
//! and a manual processing trigger.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::knowledge::KnowledgeIndex;
use crate::pipeline::MessageProcessor;
use crate::store::{Database, OrderRecord};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub processor: Arc<MessageProcessor>,
    pub index: Arc<KnowledgeIndex>,
}

/// Build the REST routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/orders", get(list_orders).post(create_order))
        .route("/accounts", get(list_accounts))
        .route("/accounts/{address}/activate", post(activate_account))
        .route("/accounts/{address}/deactivate", post(deactivate_account))
        .route("/process/{address}", post(trigger_processing))
        .route("/knowledge/search", get(search_knowledge))
        .with_state(state)
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// GET /stats
///
/// Processing counts by category and refund outcome since inception.
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.get_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error = %e, "Stats query failed");
            internal_error()
        }
    }
}

/// GET /orders
async fn list_orders(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.list_orders().await {
        Ok(orders) => Json(orders).into_response(),
        Err(e) => {
            error!(error = %e, "Order listing failed");
            internal_error()
        }
    }
}

#[derive(Deserialize)]
struct CreateOrderRequest {
    order_id: String,
    customer_email: String,
    amount: Decimal,
}

/// POST /orders
///
/// Adds an order to the ledger. Duplicate order IDs are rejected.
async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> impl IntoResponse {
    if req.order_id.trim().is_empty() || req.customer_email.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "order_id and customer_email are required"})),
        )
            .into_response();
    }

    let order = OrderRecord::new(req.order_id.trim(), req.customer_email.trim(), req.amount);
    match state.db.insert_order(&order).await {
        Ok(()) => {
            info!(order_id = %order.order_id, "Order created");
            (StatusCode::CREATED, Json(order)).into_response()
        }
        Err(crate::error::DatabaseError::Constraint(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("order {} already exists", order.order_id)})),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Order insert failed");
            internal_error()
        }
    }
}

/// GET /accounts
async fn list_accounts(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.list_accounts().await {
        Ok(accounts) => Json(accounts).into_response(),
        Err(e) => {
            error!(error = %e, "Account listing failed");
            internal_error()
        }
    }
}

/// POST /accounts/{address}/activate
async fn activate_account(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    set_account_active(state, address, true).await
}

/// POST /accounts/{address}/deactivate
///
/// Deactivation is a pure gating flag: pollers skip the account until it
/// is reactivated, nothing is drained or discarded.
async fn deactivate_account(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    set_account_active(state, address, false).await
}

async fn set_account_active(state: AppState, address: String, active: bool) -> axum::response::Response {
    match state.db.set_active(&address, active).await {
        Ok(true) => Json(json!({"account": address, "active": active})).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown account {address}")})),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Account update failed");
            internal_error()
        }
    }
}

/// POST /process/{address}
///
/// Manually trigger one processing cycle for an account. Returns 409 when
/// the account is deactivated. Safe to race with the background poller:
/// per-message records and the refund check-and-set absorb duplicates.
async fn trigger_processing(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    match state.db.is_active(&address).await {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": format!("account {address} is not active")})),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "Account lookup failed");
            return internal_error();
        }
    }

    match state.processor.process_once(&address).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!(account = %address, error = %e, "Manual processing cycle failed");
            internal_error()
        }
    }
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    3
}

/// GET /knowledge/search?q=...&k=3
async fn search_knowledge(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    match state.index.search(&query.q, query.k).await {
        Ok(hits) => {
            let results: Vec<_> = hits
                .into_iter()
                .map(|h| json!({"entry": h.entry, "score": h.score}))
                .collect();
            Json(json!({"results": results})).into_response()
        }
        Err(e) => {
            error!(error = %e, "Knowledge search failed");
            internal_error()
        }
    }
}

fn internal_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
        .into_response()
}
