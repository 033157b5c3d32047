//! Checkout flows.
//!
//! Validates customer input once for both payment paths, then branches:
//! pay-at-pickup inserts the order immediately (status "pending"), the card
//! path opens a hosted payment session carrying the full order as session
//! metadata and defers the insert to payment verification. No order ever
//! exists for an abandoned or failed card payment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::db::DbState;
use crate::events::{BusEvent, EventBus};
use crate::gate;
use crate::notify::{Mailer, OrderNotification};
use crate::orders::{
    self, CartItem, InsertOutcome, NewOrder, OrderStatus, PICKUP_TIMES,
};
use crate::pricing::{self, Totals};
use crate::stripe::{LineItem, PaymentProvider, SessionRequest};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Customer checkout submission, shared by both payment paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub items: Vec<CartItem>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub pickup_time: String,
    #[serde(default)]
    pub special_instructions: Option<String>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
}

/// Confirmation payload for a placed pay-at-pickup order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_number: String,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub pickup_time: String,
}

/// Redirect payload for a created card payment session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub url: String,
    pub session_id: String,
    pub order_number: String,
}

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("{0}")]
    Validation(String),

    /// Online ordering is closed; expected state with its own UI branch.
    #[error("online ordering is closed")]
    GateClosed,

    /// Payment provider failed or is unreachable; retryable.
    #[error("{0}")]
    Provider(String),

    #[error("{0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a checkout submission before any side effect. Totals supplied
/// by the client are cross-checked against a server-side recomputation so a
/// stale cart page cannot underpay.
fn validate(request: &CheckoutRequest) -> Result<Totals, CheckoutError> {
    let required = [
        (&request.customer_name, "name"),
        (&request.customer_email, "email"),
        (&request.customer_phone, "phone"),
        (&request.pickup_time, "pickup time"),
    ];
    for (value, label) in required {
        if value.trim().is_empty() {
            return Err(CheckoutError::Validation(format!(
                "Please provide your {label}"
            )));
        }
    }

    if !request.customer_email.contains('@') {
        return Err(CheckoutError::Validation(
            "Please provide a valid email address".to_string(),
        ));
    }

    if !PICKUP_TIMES.contains(&request.pickup_time.as_str()) {
        return Err(CheckoutError::Validation(
            "Please choose a pickup time from the list".to_string(),
        ));
    }

    if request.items.is_empty() {
        return Err(CheckoutError::Validation("Your cart is empty".to_string()));
    }
    for item in &request.items {
        if item.quantity == 0 || item.price <= 0.0 || item.name.trim().is_empty() {
            return Err(CheckoutError::Validation(
                "Your cart contains an invalid item".to_string(),
            ));
        }
    }

    let subtotal: f64 = request
        .items
        .iter()
        .map(|item| pricing::line_total(item.price, item.quantity))
        .sum();
    let totals = pricing::totals_from_subtotal(subtotal);

    if !pricing::amounts_match(totals.subtotal, request.subtotal)
        || !pricing::amounts_match(totals.total, request.total)
    {
        warn!(
            client_subtotal = request.subtotal,
            client_total = request.total,
            server_subtotal = totals.subtotal,
            server_total = totals.total,
            "Checkout totals mismatch"
        );
        return Err(CheckoutError::Validation(
            "Your cart is out of date. Please refresh and try again".to_string(),
        ));
    }

    Ok(totals)
}

fn check_gate(db: &DbState) -> Result<(), CheckoutError> {
    if gate::is_enabled(db).map_err(CheckoutError::Internal)? {
        Ok(())
    } else {
        Err(CheckoutError::GateClosed)
    }
}

// ---------------------------------------------------------------------------
// Pay-at-pickup path
// ---------------------------------------------------------------------------

/// Place a pay-at-pickup order: insert first, then fire-and-forget
/// notifications. The cart is cleared client-side only after this returns
/// success.
pub async fn place_pickup_order(
    db: &DbState,
    bus: &EventBus,
    mailer: &Arc<Mailer>,
    request: &CheckoutRequest,
) -> Result<PlacedOrder, CheckoutError> {
    check_gate(db)?;
    let totals = validate(request)?;

    let new_order = NewOrder {
        order_number: orders::generate_order_number(),
        customer_name: request.customer_name.trim().to_string(),
        customer_email: request.customer_email.trim().to_string(),
        customer_phone: request.customer_phone.trim().to_string(),
        items: request.items.clone(),
        totals,
        status: OrderStatus::Pending,
        pickup_time: request.pickup_time.clone(),
        special_instructions: normalized_instructions(request),
    };

    let record = match orders::insert_order(db, &new_order).map_err(CheckoutError::Internal)? {
        InsertOutcome::Inserted(record) => {
            bus.publish(BusEvent::OrderCreated {
                order_id: record.id.clone(),
                order_number: record.order_number.clone(),
            });
            let mailer = Arc::clone(mailer);
            let notification = OrderNotification::from(&record);
            tokio::spawn(async move {
                mailer.send_order_notifications(&notification).await;
            });
            record
        }
        // Each customer submission carries a fresh random order number, so
        // a conflict means the generator collided; the surviving row is the
        // same order either way.
        InsertOutcome::AlreadyExists(record) => record,
    };

    Ok(PlacedOrder {
        order_number: record.order_number,
        subtotal: record.subtotal,
        tax: record.tax,
        total: record.total,
        pickup_time: record.pickup_time,
    })
}

// ---------------------------------------------------------------------------
// Card path
// ---------------------------------------------------------------------------

/// Open a hosted payment session. The order is NOT created here; all data
/// needed to reconstruct it rides in the session metadata and is consumed
/// by verification once payment completes.
pub async fn create_payment_session(
    db: &DbState,
    provider: &dyn PaymentProvider,
    public_origin: &str,
    request: &CheckoutRequest,
) -> Result<PaymentSession, CheckoutError> {
    check_gate(db)?;
    let totals = validate(request)?;

    let order_number = orders::generate_order_number();

    let mut line_items: Vec<LineItem> = request
        .items
        .iter()
        .map(|item| LineItem {
            name: item.name.clone(),
            unit_amount_cents: pricing::to_cents(item.price),
            quantity: item.quantity,
        })
        .collect();
    // Tax rides as its own line so the hosted page total matches ours.
    line_items.push(LineItem {
        name: "HST (13%)".to_string(),
        unit_amount_cents: pricing::to_cents(totals.tax),
        quantity: 1,
    });

    let session_request = SessionRequest {
        line_items,
        customer_email: request.customer_email.trim().to_string(),
        success_url: format!(
            "{public_origin}/payment-success?session_id={{CHECKOUT_SESSION_ID}}"
        ),
        cancel_url: format!("{public_origin}/checkout"),
        metadata: order_metadata(&order_number, request, &totals)
            .map_err(CheckoutError::Internal)?,
    };

    let session = provider
        .create_session(&session_request)
        .await
        .map_err(CheckoutError::Provider)?;

    Ok(PaymentSession {
        url: session.url,
        session_id: session.id,
        order_number,
    })
}

/// Metadata keys consumed by verification. Everything needed to persist the
/// order must be here; the client is never trusted to resubmit it.
fn order_metadata(
    order_number: &str,
    request: &CheckoutRequest,
    totals: &Totals,
) -> Result<HashMap<String, String>, String> {
    let items_json =
        serde_json::to_string(&request.items).map_err(|e| format!("serialize items: {e}"))?;

    let mut metadata = HashMap::new();
    metadata.insert("orderNumber".to_string(), order_number.to_string());
    metadata.insert(
        "customerName".to_string(),
        request.customer_name.trim().to_string(),
    );
    metadata.insert(
        "customerEmail".to_string(),
        request.customer_email.trim().to_string(),
    );
    metadata.insert(
        "customerPhone".to_string(),
        request.customer_phone.trim().to_string(),
    );
    metadata.insert("pickupTime".to_string(), request.pickup_time.clone());
    metadata.insert(
        "specialInstructions".to_string(),
        normalized_instructions(request).unwrap_or_default(),
    );
    metadata.insert("items".to_string(), items_json);
    metadata.insert("subtotal".to_string(), totals.subtotal.to_string());
    metadata.insert("tax".to_string(), totals.tax.to_string());
    metadata.insert("total".to_string(), totals.total.to_string());
    Ok(metadata)
}

fn normalized_instructions(request: &CheckoutRequest) -> Option<String> {
    request
        .special_instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ===========================================================================
// Tests
// ===========================================================================
