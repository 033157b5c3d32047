//! HTTP surface for The Small Orders.
//!
//! Routes fall into three groups: public ordering endpoints (menu,
//! checkout, verification, contact), the SSE event stream shared by all
//! clients, and staff endpoints guarded by the bearer-session extractor.
//! Handlers stay thin; behavior lives in the service modules.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, Method},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use crate::alerts::AlertEngine;
use crate::auth::{self, AuthState, LoginError, StaffSession};
use crate::checkout::{self, CheckoutError, CheckoutRequest};
use crate::config::Config;
use crate::db::DbState;
use crate::error::ApiError;
use crate::events::{BusEvent, EventBus};
use crate::gate;
use crate::menu;
use crate::notify::Mailer;
use crate::orders::{self, OrderStatus};
use crate::stripe::PaymentProvider;
use crate::verify::{self, VerifyError, VerifyOutcome};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub mailer: Arc<Mailer>,
    /// `None` when no payment key is configured; the card path then fails
    /// fast without touching the network.
    pub provider: Option<Arc<dyn PaymentProvider>>,
    pub auth: Arc<AuthState>,
    pub alerts: Arc<AlertEngine>,
}

// ---------------------------------------------------------------------------
// Error lifting
// ---------------------------------------------------------------------------

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Validation(message) => ApiError::Validation(message),
            CheckoutError::GateClosed => ApiError::GateClosed,
            CheckoutError::Provider(detail) => ApiError::Upstream(detail),
            CheckoutError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<VerifyError> for ApiError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Provider(detail) => ApiError::Upstream(detail),
            VerifyError::BadMetadata(detail) => ApiError::Upstream(detail),
            VerifyError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<LoginError> for ApiError {
    fn from(err: LoginError) -> Self {
        match err {
            LoginError::Locked => ApiError::Locked,
            LoginError::InvalidPin => ApiError::Unauthorized("Invalid PIN".to_string()),
            LoginError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

// ---------------------------------------------------------------------------
// Staff session extractor
// ---------------------------------------------------------------------------

/// Extracts and refreshes the staff session behind `Authorization: Bearer`.
pub struct Staff(pub StaffSession);

fn parse_bearer(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for Staff {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer)
            .ok_or_else(|| ApiError::Unauthorized("Staff login required".to_string()))?;

        let session = auth::validate_session(&state.auth, token)
            .ok_or_else(|| ApiError::Unauthorized("Session expired".to_string()))?;
        Ok(Staff(session))
    }
}

fn require(session: &StaffSession, permission: &str) -> Result<(), ApiError> {
    if session.permissions.iter().any(|p| p == permission) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized(format!(
            "Missing permission: {permission}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Public handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn get_menu(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let items = menu::list_items(&state.db)?;
    let ordering_enabled = gate::is_enabled(&state.db)?;
    Ok(Json(json!({
        "items": items,
        "orderingEnabled": ordering_enabled,
    })))
}

async fn get_pickup_setting(
    State(state): State<AppState>,
) -> Result<Json<gate::GateStatus>, ApiError> {
    Ok(Json(gate::status(&state.db)?))
}

async fn post_pickup_order(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let placed =
        checkout::place_pickup_order(&state.db, &state.bus, &state.mailer, &request).await?;
    let mut body = serde_json::to_value(&placed).map_err(|e| ApiError::Internal(e.to_string()))?;
    body["success"] = json!(true);
    Ok(Json(body))
}

async fn post_payment_session(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<checkout::PaymentSession>, ApiError> {
    let provider = state
        .provider
        .as_ref()
        .ok_or_else(|| ApiError::Upstream("card payments are not configured".to_string()))?;

    let session = checkout::create_payment_session(
        &state.db,
        provider.as_ref(),
        &state.config.public_origin,
        &request,
    )
    .await?;
    Ok(Json(session))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    session_id: String,
}

async fn post_verify_payment(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.session_id.trim().is_empty() {
        return Err(ApiError::Validation("Session ID is required".to_string()));
    }

    let provider = state
        .provider
        .as_ref()
        .ok_or_else(|| ApiError::Upstream("card payments are not configured".to_string()))?;

    let outcome = verify::verify_payment(
        &state.db,
        &state.bus,
        &state.mailer,
        provider.as_ref(),
        request.session_id.trim(),
    )
    .await?;

    match outcome {
        VerifyOutcome::Verified(verified) => {
            let mut body =
                serde_json::to_value(&verified).map_err(|e| ApiError::Internal(e.to_string()))?;
            body["success"] = json!(true);
            Ok(Json(body))
        }
        VerifyOutcome::NotPaid => Ok(Json(json!({
            "success": false,
            "message": "Payment not completed",
        }))),
    }
}

#[derive(Deserialize)]
struct ContactRequest {
    name: String,
    email: String,
    message: String,
}

async fn post_contact(
    State(state): State<AppState>,
    Json(request): Json<ContactRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.name.trim().is_empty()
        || request.email.trim().is_empty()
        || request.message.trim().is_empty()
    {
        return Err(ApiError::Validation(
            "Name, email, and message are required".to_string(),
        ));
    }

    // Fire-and-forget; the sender never blocks the response.
    let mailer = Arc::clone(&state.mailer);
    tokio::spawn(async move {
        mailer
            .send_contact_message(
                request.name.trim(),
                request.email.trim(),
                request.message.trim(),
            )
            .await;
    });

    Ok(Json(json!({ "success": true })))
}

async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| match event {
        Ok(event) => Event::default().json_data(&event).ok().map(Ok),
        // Lagged receivers just skip ahead; consumers refetch on the next
        // event rather than relying on completeness.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Staff handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupPinRequest {
    admin_pin: Option<String>,
    staff_pin: Option<String>,
}

async fn post_setup_pin(
    State(state): State<AppState>,
    parts: axum::http::HeaderMap,
    Json(request): Json<SetupPinRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // First-run setup is open; afterwards only an admin may change PINs.
    if auth::pin_configured(&state.db)? {
        let token = parts
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer)
            .ok_or_else(|| ApiError::Unauthorized("Staff login required".to_string()))?;
        if !auth::has_permission(&state.auth, token, "manage_staff") {
            return Err(ApiError::Unauthorized(
                "Only an administrator can change PINs".to_string(),
            ));
        }
    }

    auth::setup_pin(
        &state.db,
        request.admin_pin.as_deref(),
        request.staff_pin.as_deref(),
    )
    .map_err(ApiError::Validation)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct LoginRequest {
    pin: String,
}

async fn post_login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = auth::login(&state.db, &state.auth, &request.pin)?;
    Ok(Json(json!({
        "sessionId": session.session_id,
        "role": session.role,
        "permissions": session.permissions,
        "loginTime": session.login_time.to_rfc3339(),
    })))
}

async fn post_logout(
    State(state): State<AppState>,
    parts: axum::http::HeaderMap,
) -> Json<serde_json::Value> {
    if let Some(token) = parts
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer)
    {
        auth::logout(&state.auth, token);
    }
    Json(json!({ "success": true }))
}

async fn get_today_orders(
    Staff(session): Staff,
    State(state): State<AppState>,
) -> Result<Json<Vec<orders::OrderRecord>>, ApiError> {
    require(&session, "view_orders")?;
    Ok(Json(orders::list_today(&state.db, Utc::now())?))
}

#[derive(Deserialize)]
struct StatusRequest {
    status: String,
}

async fn post_order_status(
    Staff(session): Staff,
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<orders::OrderRecord>, ApiError> {
    require(&session, "update_order_status")?;

    let status = OrderStatus::parse(&request.status)
        .ok_or_else(|| ApiError::Validation(format!("Unknown status: {}", request.status)))?;

    let record = orders::update_status(&state.db, &order_id, status)?
        .ok_or_else(|| ApiError::NotFound("Order not found".to_string()))?;

    state.bus.publish(BusEvent::OrderStatusUpdated {
        order_id: record.id.clone(),
        status: record.status.clone(),
    });
    Ok(Json(record))
}

async fn post_acknowledge_order(
    Staff(session): Staff,
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require(&session, "acknowledge_order")?;

    if !state.alerts.acknowledge(&order_id)? {
        return Err(ApiError::NotFound("Order not found".to_string()));
    }
    Ok(Json(json!({ "success": true, "orderId": order_id })))
}

async fn post_enable_audio(
    Staff(session): Staff,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require(&session, "view_orders")?;
    state.alerts.enable_audio();
    Ok(Json(json!({
        "audioEnabled": true,
        "unacknowledged": state.alerts.backlog_count(),
    })))
}

#[derive(Deserialize)]
struct GateRequest {
    enabled: bool,
}

async fn put_pickup_setting(
    Staff(session): Staff,
    State(state): State<AppState>,
    Json(request): Json<GateRequest>,
) -> Result<Json<gate::GateStatus>, ApiError> {
    require(&session, "manage_pickup_gate")?;
    Ok(Json(gate::set_enabled(
        &state.db,
        &state.bus,
        request.enabled,
    )?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityRequest {
    is_available: bool,
}

async fn put_menu_availability(
    Staff(session): Staff,
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(request): Json<AvailabilityRequest>,
) -> Result<Json<menu::MenuItem>, ApiError> {
    require(&session, "manage_menu")?;

    menu::set_availability(&state.db, &state.bus, &item_id, request.is_available)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Menu item not found".to_string()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/menu", get(get_menu))
        .route("/api/settings/pickup", get(get_pickup_setting))
        .route("/api/checkout/order", post(post_pickup_order))
        .route("/api/checkout/session", post(post_payment_session))
        .route("/api/checkout/verify", post(post_verify_payment))
        .route("/api/contact", post(post_contact))
        .route("/api/events", get(events_stream))
        .route("/api/staff/setup-pin", post(post_setup_pin))
        .route("/api/staff/login", post(post_login))
        .route("/api/staff/logout", post(post_logout))
        .route("/api/staff/orders/today", get(get_today_orders))
        .route("/api/staff/orders/:id/status", post(post_order_status))
        .route(
            "/api/staff/orders/:id/acknowledge",
            post(post_acknowledge_order),
        )
        .route("/api/staff/alerts/enable-audio", post(post_enable_audio))
        .route("/api/staff/settings/pickup", put(put_pickup_setting))
        .route("/api/staff/menu/:id/availability", put(put_menu_availability))
        .layer(cors)
        .with_state(state)
}

// ===========================================================================
// Tests
// ===========================================================================
