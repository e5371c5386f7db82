use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use finlock::error::{ProviderError, StoreError};
use finlock::state::TransactionStatus;
use finlock::store::TransactionFilter;
use finlock_engine::error::{AuthorizeError, LockError};
use finlock_engine::lifecycle::{AuthorizeRequest, DetailsError};

use crate::auth::{caller, require_bearer};
use crate::webhook::provider_webhook;
use crate::AppState;

const DEFAULT_TXN_LIMIT: i64 = 50;
const MAX_TXN_LIMIT: i64 = 500;

/// Build the axum router
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/card/authorize", post(authorize))
        .route("/v1/card/lock", post(lock))
        .route("/v1/card/status", get(card_status))
        .route("/v1/card/details", get(card_details))
        .route("/v1/transactions", get(list_transactions))
        .route("/v1/ledger", get(ledger))
        .route("/v1/admin/instruments", post(register_instrument))
        .route("/v1/admin/sweep", post(sweep_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .merge(protected)
        // Authenticated by HMAC signature, not the bearer token
        .route("/v1/webhooks/provider", post(provider_webhook))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

fn internal(context: &str, e: &dyn std::fmt::Display) -> Response {
    tracing::error!(error = %e, "{} failed", context);
    error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

fn shutting_down() -> Response {
    error_json(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
}

fn provider_status(e: &ProviderError) -> StatusCode {
    match e {
        ProviderError::RateLimited { .. } | ProviderError::Timeout { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// POST /v1/card/authorize
async fn authorize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AuthorizeRequest>,
) -> Response {
    let user_id = match caller(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if state.engine.is_shutting_down() {
        return shutting_down();
    }

    match state.engine.authorize(user_id, &req).await {
        Ok(auth) => (StatusCode::CREATED, Json(auth)).into_response(),
        Err(AuthorizeError::Invalid(msg)) => error_json(StatusCode::UNPROCESSABLE_ENTITY, msg),
        Err(AuthorizeError::NoInstrument(_)) => {
            error_json(StatusCode::NOT_FOUND, "no instrument registered")
        }
        Err(AuthorizeError::Conflict {
            session_id,
            expires_at,
        }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "an authorization session is already active",
                "session_id": session_id,
                "expires_at": expires_at,
            })),
        )
            .into_response(),
        Err(AuthorizeError::LockPending(msg)) => {
            tracing::warn!(%user_id, reason = %msg, "authorize refused, re-lock pending");
            error_json(
                StatusCode::SERVICE_UNAVAILABLE,
                "card re-lock pending, try again shortly",
            )
        }
        Err(AuthorizeError::Provider(e)) => {
            error_json(provider_status(&e), format!("card provider error: {}", e))
        }
        Err(AuthorizeError::Store(e)) => internal("authorize", &e),
    }
}

/// POST /v1/card/lock
async fn lock(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = match caller(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.engine.lock_for_user(user_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "locked",
                "instrument_id": outcome.instrument_id,
                "cancelled_session": outcome.cancelled_session,
                "expired_session": outcome.expired_session,
            })),
        )
            .into_response(),
        Err(LockError::NoInstrument(_)) => error_json(StatusCode::NOT_FOUND, "no instrument registered"),
        Err(LockError::Pending(msg)) => {
            tracing::warn!(%user_id, reason = %msg, "lock queued for retry");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "lock_pending", "error": msg})),
            )
                .into_response()
        }
        Err(LockError::Store(e)) => internal("lock", &e),
    }
}

/// GET /v1/card/status
async fn card_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = match caller(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.engine.card_status(user_id).await {
        Ok(Some(status)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "instrument_id": status.instrument.id,
                "status": status.instrument.status.as_str(),
                "active_session": status.active_session,
            })),
        )
            .into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "no instrument registered"),
        Err(e) => internal("card status", &e),
    }
}

/// GET /v1/card/details
async fn card_details(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = match caller(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.engine.card_details(user_id).await {
        Ok(Some(card)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "token": card.token,
                "state": card.state,
                "masked_number": card.masked_number(),
                "exp_month": card.exp_month,
                "exp_year": card.exp_year,
            })),
        )
            .into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "no instrument registered"),
        Err(DetailsError::Provider(e)) => {
            error_json(provider_status(&e), format!("card provider error: {}", e))
        }
        Err(DetailsError::Store(e)) => internal("card details", &e),
    }
}

/// GET /v1/transactions
#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub limit: Option<i64>,
    pub status: Option<String>,
    pub category: Option<String>,
}

async fn list_transactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TransactionsQuery>,
) -> Response {
    let user_id = match caller(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let status = match query.status.as_deref() {
        None => None,
        Some(s) => match TransactionStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return error_json(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("unknown transaction status: {}", s),
                )
            }
        },
    };
    let filter = TransactionFilter {
        status,
        category: query.category,
        limit: query
            .limit
            .unwrap_or(DEFAULT_TXN_LIMIT)
            .clamp(1, MAX_TXN_LIMIT),
    };

    match state.engine.transactions(user_id, &filter).await {
        Ok(transactions) => (
            StatusCode::OK,
            Json(serde_json::json!({"transactions": transactions})),
        )
            .into_response(),
        Err(e) => internal("list transactions", &e),
    }
}

/// GET /v1/ledger
async fn ledger(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = match caller(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.engine.ledger(user_id).await {
        Ok(entries) => (StatusCode::OK, Json(serde_json::json!({"ledger": entries}))).into_response(),
        Err(e) => internal("ledger", &e),
    }
}

/// POST /v1/admin/instruments
#[derive(Debug, Deserialize)]
pub struct RegisterInstrumentRequest {
    pub user_id: Uuid,
    pub provider_ref: String,
}

async fn register_instrument(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterInstrumentRequest>,
) -> Response {
    if req.provider_ref.trim().is_empty() {
        return error_json(StatusCode::UNPROCESSABLE_ENTITY, "provider_ref is required");
    }

    match state
        .engine
        .register_instrument(req.user_id, req.provider_ref.trim())
        .await
    {
        Ok(instrument) => (StatusCode::CREATED, Json(instrument)).into_response(),
        Err(e @ StoreError::Duplicate(_)) => error_json(StatusCode::CONFLICT, e.to_string()),
        Err(e) => internal("register instrument", &e),
    }
}

/// POST /v1/admin/sweep
///
/// Run one reconciliation tick and return its counts.
async fn sweep_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.engine.is_shutting_down() {
        return shutting_down();
    }
    let result = state.engine.sweep().await;
    (StatusCode::OK, Json(result)).into_response()
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.engine.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "shutting_down"})),
        )
            .into_response();
    }

    let Some(pool) = &state.pool else {
        return (StatusCode::OK, Json(serde_json::json!({"status": "healthy"}))).into_response();
    };
    match pool.get().await {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({"status": "healthy"}))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unhealthy", "error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /metrics
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let encoder = prometheus::TextEncoder::new();
    let families = state.registry.gather();
    match encoder.encode_to_string(&families) {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding error: {}", e),
        )
            .into_response(),
    }
}
