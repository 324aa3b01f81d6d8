//! Axum router and all HTTP handlers for loyal-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers.
//!
//! User routes trust the `X-User-Id` header set by the fronting auth layer
//! after token verification. A missing or unparseable header is a 401.

use std::{convert::Infallible, sync::Arc};

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use loyal_db::intake::{self, OrderIntake};
use loyal_db::{BalanceLedger, IntakeError, LedgerError, OrderStore, StoreError};
use loyal_schemas::{Points, UserId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, warn};

use crate::{
    api_types::{
        BalanceResponse, ErrorResponse, HealthResponse, OrderView, WithdrawRequest, WithdrawalView,
    },
    state::{AppState, BusMsg},
};

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/api/user/orders", post(submit_order).get(list_orders))
        .route("/api/user/balance", get(balance))
        .route("/api/user/balance/withdraw", post(withdraw))
        .route("/api/user/withdrawals", get(withdrawals))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors and auth
// ---------------------------------------------------------------------------

/// Handler error: a status code plus the `{"error": ...}` body.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    msg: String,
}

impl ApiError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
        }
    }

    fn internal(context: &str, e: impl std::fmt::Display) -> Self {
        error!(error = %e, "{context}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, context)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.msg })).into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Empty => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            IntakeError::InvalidChecksum(_) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            IntakeError::OrderConflict { .. } => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            IntakeError::Store(e) => ApiError::internal("order registration failed", e),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InvalidOrderNumber(_) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            LedgerError::NonPositiveAmount(_) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            LedgerError::InsufficientFunds { .. } => {
                ApiError::new(StatusCode::PAYMENT_REQUIRED, e.to_string())
            }
            LedgerError::Store(e) => ApiError::internal("withdrawal failed", e),
        }
    }
}

/// Authenticated caller, taken from [`USER_ID_HEADER`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct AuthUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<UserId>().ok())
            .map(AuthUser)
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "user is not authenticated"))
    }
}

fn store_failure(what: &str, e: StoreError) -> ApiError {
    ApiError::internal(what, e)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// /api/user/orders
// ---------------------------------------------------------------------------

/// Register an order number sent as the raw text body.
pub(crate) async fn submit_order(
    State(st): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    body: String,
) -> Result<StatusCode, ApiError> {
    match intake::submit_order(st.storage.as_ref(), user_id, &body).await {
        Ok(OrderIntake::Accepted(_)) => Ok(StatusCode::ACCEPTED),
        Ok(OrderIntake::AlreadyUploaded(_)) => Ok(StatusCode::OK),
        Err(e) => {
            if !matches!(e, IntakeError::Store(_)) {
                warn!(user_id, error = %e, "order rejected");
            }
            Err(e.into())
        }
    }
}

pub(crate) async fn list_orders(
    State(st): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Response, ApiError> {
    let orders = st
        .storage
        .orders_by_user(user_id)
        .await
        .map_err(|e| store_failure("listing orders failed", e))?;

    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let views: Vec<OrderView> = orders.into_iter().map(OrderView::from).collect();
    Ok((StatusCode::OK, Json(views)).into_response())
}

// ---------------------------------------------------------------------------
// /api/user/balance
// ---------------------------------------------------------------------------

pub(crate) async fn balance(
    State(st): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let b = st
        .storage
        .balance(user_id)
        .await
        .map_err(|e| store_failure("reading balance failed", e))?;
    Ok(Json(BalanceResponse::from(b)))
}

/// Spend points. The body is parsed by hand so that malformed JSON is a 400,
/// keeping 422 for a reference that fails the checksum.
pub(crate) async fn withdraw(
    State(st): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    body: Bytes,
) -> Result<Json<WithdrawalView>, ApiError> {
    let req: WithdrawRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("malformed request: {e}")))?;

    if req.order.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "order is required"));
    }
    let sum = Points::from_f64(req.sum)
        .filter(|p| p.is_positive())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "sum must be a positive number"))?;

    match intake::withdraw(st.storage.as_ref(), user_id, &req.order, sum).await {
        Ok(w) => Ok(Json(WithdrawalView::from(w))),
        Err(e) => {
            if !matches!(e, LedgerError::Store(_)) {
                warn!(user_id, error = %e, "withdrawal refused");
            }
            Err(e.into())
        }
    }
}

pub(crate) async fn withdrawals(
    State(st): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Response, ApiError> {
    let list = st
        .storage
        .withdrawals(user_id)
        .await
        .map_err(|e| store_failure("listing withdrawals failed", e))?;

    if list.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let views: Vec<WithdrawalView> = list.into_iter().map(WithdrawalView::from).collect();
    Ok((StatusCode::OK, Json(views)).into_response())
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE, per user)
// ---------------------------------------------------------------------------

/// Server-sent events for the caller: heartbeats plus their own order
/// status changes and credits.
pub(crate) async fn stream(
    State(st): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx, user_id);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
    user_id: UserId,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(move |msg| async move {
        match msg {
            Ok(m) if m.visible_to(user_id) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Ok(_) => None,
            Err(_) => None, // lagged / closed
        }
    })
}
