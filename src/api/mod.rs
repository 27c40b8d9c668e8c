//! HTTP surface for the storefront and the back-office.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use validator::Validate;

use crate::domain::value_objects::{AdminId, PageRequest, Reason, UserId, ValueError};
use crate::{ErrorKind, LoyaltyError, PointsService, PointsSnapshot, PointsTransaction, ReconciliationReport, TierConfig, TierProgress, TransactionPage};

pub const ADMIN_HEADER: &str = "x-admin-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PointsService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tiers", get(list_tiers))
        .route("/api/v1/points/:user_id", get(get_points))
        .route("/api/v1/points/:user_id/progress", get(get_progress))
        .route("/api/v1/points/:user_id/transactions", get(list_transactions))
        .route("/api/v1/points/:user_id/earn", post(earn_points))
        .route("/api/v1/points/:user_id/spend", post(spend_points))
        .route("/api/v1/points/:user_id/purchases", post(award_purchase))
        .route("/api/v1/admin/points/:user_id", put(set_points))
        .route("/api/v1/admin/points/:user_id/reconcile", get(reconcile))
        .route("/api/v1/admin/transactions", get(recent_transactions))
        .route("/api/v1/admin/transactions/stream", get(stream_transactions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { error: ErrorBody { code: kind.as_str(), message: message.into() } }
    }

    fn status(&self) -> StatusCode {
        match self.error.code {
            "insufficient_balance" => StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error" => StatusCode::BAD_REQUEST,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "conflict" => StatusCode::CONFLICT,
            "timeout" => StatusCode::GATEWAY_TIMEOUT,
            "store_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self { error: ErrorBody { code: "unauthorized", message: message.into() } }
    }
}

impl From<LoyaltyError> for ApiError {
    fn from(e: LoyaltyError) -> Self {
        let kind = e.kind();
        let message = match kind {
            ErrorKind::InsufficientBalance | ErrorKind::Validation | ErrorKind::Conflict => e.to_string(),
            ErrorKind::Timeout => "points ledger did not respond in time".to_string(),
            ErrorKind::StoreUnavailable => "points ledger is unavailable".to_string(),
            ErrorKind::Internal => "points ledger failed".to_string(),
        };
        Self::new(kind, message)
    }
}

impl From<ValueError> for ApiError {
    fn from(e: ValueError) -> Self { Self::new(ErrorKind::Validation, e.to_string()) }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self { Self::new(ErrorKind::Validation, e.to_string()) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response { (self.status(), Json(self)).into_response() }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct PointsRequest {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetPointsRequest {
    #[validate(range(min = 0))]
    pub balance: i64,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    #[validate(length(min = 1, max = 64))]
    pub order_id: String,
    pub order_total: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    pub awarded: i64,
    pub transaction: Option<PointsTransaction>,
}

/// Every `/api/v1/admin` route requires the back-office caller to identify itself.
fn require_admin(headers: &HeaderMap) -> Result<AdminId, ApiError> {
    admin_from(headers)?.ok_or_else(|| ApiError::unauthorized(format!("{ADMIN_HEADER} header is required")))
}

fn admin_from(headers: &HeaderMap) -> Result<Option<AdminId>, ApiError> {
    match headers.get(ADMIN_HEADER) {
        None => Ok(None),
        Some(value) => {
            let raw = value.to_str().map_err(|_| ApiError::unauthorized("admin id header is not valid text"))?;
            AdminId::new(raw).map(Some).map_err(|e| ApiError::unauthorized(e.to_string()))
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(s): State<AppState>) -> impl IntoResponse {
    match s.service.ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "healthy", "service": "opensase-loyalty"}))),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status": "unhealthy", "service": "opensase-loyalty"}))),
    }
}

async fn list_tiers(State(s): State<AppState>) -> Json<TierConfig> {
    Json(s.service.tier_config().as_ref().clone())
}

async fn get_points(State(s): State<AppState>, Path(user_id): Path<String>) -> ApiResult<PointsSnapshot> {
    let user_id = UserId::new(user_id)?;
    Ok(Json(s.service.get_user_points(&user_id).await?))
}

async fn get_progress(State(s): State<AppState>, Path(user_id): Path<String>) -> ApiResult<TierProgress> {
    let user_id = UserId::new(user_id)?;
    Ok(Json(s.service.tier_progress(&user_id).await?))
}

async fn list_transactions(State(s): State<AppState>, Path(user_id): Path<String>, Query(q): Query<TransactionsQuery>) -> ApiResult<TransactionPage> {
    let user_id = UserId::new(user_id)?;
    Ok(Json(s.service.get_points_transactions(&user_id, PageRequest::new(q.before, q.limit)).await?))
}

async fn earn_points(State(s): State<AppState>, Path(user_id): Path<String>, headers: HeaderMap, Json(r): Json<PointsRequest>) -> Result<(StatusCode, Json<PointsTransaction>), ApiError> {
    r.validate()?;
    let user_id = UserId::new(user_id)?;
    let tx = s.service.add_points(&user_id, r.amount, Reason::new(r.reason)?, admin_from(&headers)?).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

async fn spend_points(State(s): State<AppState>, Path(user_id): Path<String>, headers: HeaderMap, Json(r): Json<PointsRequest>) -> Result<(StatusCode, Json<PointsTransaction>), ApiError> {
    r.validate()?;
    let user_id = UserId::new(user_id)?;
    let tx = s.service.subtract_points(&user_id, r.amount, Reason::new(r.reason)?, admin_from(&headers)?).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

async fn award_purchase(State(s): State<AppState>, Path(user_id): Path<String>, Json(r): Json<PurchaseRequest>) -> ApiResult<PurchaseResponse> {
    r.validate()?;
    let user_id = UserId::new(user_id)?;
    let tx = s.service.award_purchase_points(&user_id, &r.order_id, r.order_total).await?;
    Ok(Json(PurchaseResponse { awarded: tx.as_ref().map_or(0, |t| t.amount), transaction: tx }))
}

async fn set_points(State(s): State<AppState>, Path(user_id): Path<String>, headers: HeaderMap, Json(r): Json<SetPointsRequest>) -> ApiResult<PointsTransaction> {
    let admin_id = require_admin(&headers)?;
    r.validate()?;
    let user_id = UserId::new(user_id)?;
    Ok(Json(s.service.set_points(&user_id, r.balance, Reason::new(r.reason)?, admin_id).await?))
}

async fn reconcile(State(s): State<AppState>, Path(user_id): Path<String>, headers: HeaderMap) -> ApiResult<ReconciliationReport> {
    require_admin(&headers)?;
    let user_id = UserId::new(user_id)?;
    Ok(Json(s.service.reconcile(&user_id).await?))
}

async fn recent_transactions(State(s): State<AppState>, headers: HeaderMap, Query(q): Query<TransactionsQuery>) -> ApiResult<Vec<PointsTransaction>> {
    require_admin(&headers)?;
    Ok(Json(s.service.recent_transactions(q.limit.unwrap_or(50)).await?))
}

async fn stream_transactions(State(s): State<AppState>, headers: HeaderMap) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let admin_id = require_admin(&headers)?;
    tracing::info!(%admin_id, "admin subscribed to the transaction stream");
    let feed = s.service.subscribe();
    let events = futures::stream::unfold(feed, |mut feed| async move {
        loop {
            match feed.recv().await {
                Ok(tx) => {
                    let event = Event::default()
                        .event("points_transaction")
                        .json_data(&tx)
                        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
                    return Some((Ok::<_, Infallible>(event), feed));
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "transaction stream subscriber lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
