//! HTTP API for the warden daemon.
//!
//! Provides REST endpoints for:
//! - Health check and Prometheus metrics
//! - Proposing, approving and rejecting opportunities
//! - Running a reconciliation tick
//! - Kill switch
//! - Portfolio PnL and open positions
//! - Manual close and profit-take decisions
//! - Audit chain verification
//!
//! Callers identify themselves with an optional `X-Actor-Id` header; approvals
//! take an optional `Idempotency-Key` header.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use warden_domain::{Opportunity, Position, ProfitTakeRequest};
use warden_eventlog::ChainReport;
use warden_exec::BrokerPort;
use warden_store::Store;

use crate::actor::Actor;
use crate::approval::{ApprovalOutcome, ProposeOpportunity};
use crate::error::DaemonError;
use crate::kill_switch::{KillSwitchReport, KillSwitchSource};
use crate::portfolio::{OpenPositionView, PortfolioReport};
use crate::reconciler::TickReport;
use crate::services::Services;

const IDEMPOTENCY_KEY: &str = "idempotency-key";
const ACTOR_ID: &str = "x-actor-id";

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState<B: BrokerPort + 'static, S: Store + 'static> {
    pub services: Arc<Services<B, S>>,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Request to approve an opportunity.
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub quantity: Decimal,
}

/// Request to reject an opportunity.
#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router<B, S>(state: Arc<ApiState<B, S>>) -> Router
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/opportunities", post(propose_handler))
        .route("/opportunities/:id/approve", post(approve_handler))
        .route("/opportunities/:id/reject", post(reject_handler))
        .route("/reconcile/tick", post(tick_handler))
        .route("/kill-switch", post(kill_switch_handler))
        .route("/portfolio/pnl", get(pnl_handler))
        .route("/positions/open", get(open_positions_handler))
        .route("/positions/:id/close", post(close_handler))
        .route("/profit-takes/:id/approve", post(approve_profit_take_handler))
        .route("/profit-takes/:id/deny", post(deny_profit_take_handler))
        .route("/audit/verify", get(verify_audit_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus text exposition.
async fn metrics_handler<B, S>(State(state): State<Arc<ApiState<B, S>>>) -> impl IntoResponse
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    match state.services.metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => to_error_response(e).into_response(),
    }
}

async fn propose_handler<B, S>(
    State(state): State<Arc<ApiState<B, S>>>,
    headers: HeaderMap,
    Json(request): Json<ProposeOpportunity>,
) -> ApiResult<Opportunity>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let opportunity = state
        .services
        .approvals
        .propose(request, &actor_from(&headers))
        .await
        .map_err(to_error_response)?;
    Ok(Json(opportunity))
}

async fn approve_handler<B, S>(
    State(state): State<Arc<ApiState<B, S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<ApprovalOutcome>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let key = headers.get(IDEMPOTENCY_KEY).and_then(|v| v.to_str().ok());
    let outcome = state
        .services
        .approvals
        .approve(id, request.quantity, key, &actor_from(&headers))
        .await
        .map_err(to_error_response)?;
    Ok(Json(outcome))
}

async fn reject_handler<B, S>(
    State(state): State<Arc<ApiState<B, S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<RejectRequest>,
) -> ApiResult<Opportunity>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let opportunity = state
        .services
        .approvals
        .reject(id, &request.reason, &actor_from(&headers))
        .await
        .map_err(to_error_response)?;
    Ok(Json(opportunity))
}

async fn tick_handler<B, S>(State(state): State<Arc<ApiState<B, S>>>) -> ApiResult<TickReport>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let report = state.services.reconciler.tick().await.map_err(to_error_response)?;
    Ok(Json(report))
}

/// Emergency liquidation of the whole book.
async fn kill_switch_handler<B, S>(
    State(state): State<Arc<ApiState<B, S>>>,
    headers: HeaderMap,
) -> ApiResult<KillSwitchReport>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let report = state
        .services
        .kill_switch
        .trigger(KillSwitchSource::Manual, &actor_from(&headers))
        .await
        .map_err(to_error_response)?;
    Ok(Json(report))
}

async fn pnl_handler<B, S>(State(state): State<Arc<ApiState<B, S>>>) -> ApiResult<PortfolioReport>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let report = state.services.portfolio.report(Utc::now()).await.map_err(to_error_response)?;
    Ok(Json(report))
}

async fn open_positions_handler<B, S>(State(state): State<Arc<ApiState<B, S>>>) -> ApiResult<Vec<OpenPositionView>>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let positions = state.services.portfolio.open_positions().await.map_err(to_error_response)?;
    Ok(Json(positions))
}

async fn close_handler<B, S>(
    State(state): State<Arc<ApiState<B, S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Position>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let position = state
        .services
        .closer
        .close_manually(id, &actor_from(&headers))
        .await
        .map_err(to_error_response)?;
    Ok(Json(position))
}

async fn approve_profit_take_handler<B, S>(
    State(state): State<Arc<ApiState<B, S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Position>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let position = state
        .services
        .profit_takes
        .approve(id, &actor_from(&headers))
        .await
        .map_err(to_error_response)?;
    Ok(Json(position))
}

async fn deny_profit_take_handler<B, S>(
    State(state): State<Arc<ApiState<B, S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<ProfitTakeRequest>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let request = state
        .services
        .profit_takes
        .deny(id, &actor_from(&headers))
        .await
        .map_err(to_error_response)?;
    Ok(Json(request))
}

async fn verify_audit_handler<B, S>(State(state): State<Arc<ApiState<B, S>>>) -> ApiResult<ChainReport>
where
    B: BrokerPort + 'static,
    S: Store + 'static,
{
    let report = state
        .services
        .ledger
        .verify()
        .await
        .map_err(|e| to_error_response(e.into()))?;
    Ok(Json(report))
}

// =============================================================================
// Helpers
// =============================================================================

fn actor_from(headers: &HeaderMap) -> Actor {
    let id = headers
        .get(ACTOR_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    Actor::user(id)
}

fn to_error_response(error: DaemonError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, kind) = match &error {
        DaemonError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        DaemonError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        DaemonError::RiskLimitExceeded { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "risk_limit_exceeded"),
        DaemonError::ConcurrencyConflict(_) => (StatusCode::CONFLICT, "concurrency_conflict"),
        DaemonError::Broker(_) => (StatusCode::BAD_GATEWAY, "broker"),
        DaemonError::NoMarketData(_) => (StatusCode::SERVICE_UNAVAILABLE, "no_market_data"),
        DaemonError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
        DaemonError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
    };

    (status, Json(ErrorResponse { error: error.to_string(), kind }))
}

// =============================================================================
// Tests
// =============================================================================
