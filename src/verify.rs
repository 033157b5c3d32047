//! Payment verification.
//!
//! Converts a completed payment session into exactly one persisted order
//! and exactly one notification dispatch, no matter how many times it is
//! called. The order number carried in the session metadata is the
//! idempotency key: a lookup hit or a UNIQUE-constraint conflict on insert
//! both resolve to the same success payload a fresh verification would
//! return, without re-notifying. An incomplete payment is a non-success,
//! non-error result the customer can retry from checkout.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::DbState;
use crate::events::{BusEvent, EventBus};
use crate::notify::{Mailer, OrderNotification};
use crate::orders::{self, CartItem, InsertOutcome, NewOrder, OrderRecord, OrderStatus};
use crate::pricing::Totals;
use crate::stripe::{PaymentProvider, RetrievedSession};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Success payload shown on the payment-success page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedOrder {
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub pickup_time: String,
    pub total: f64,
    /// True when an earlier verification already persisted this order.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_processed: bool,
}

/// Terminal states of a verification call.
#[derive(Debug)]
pub enum VerifyOutcome {
    /// Payment confirmed; the order exists (created now or earlier).
    Verified(VerifiedOrder),
    /// Session exists but payment did not complete. No order was created;
    /// the customer may retry checkout.
    NotPaid,
}

#[derive(Error, Debug)]
pub enum VerifyError {
    /// Provider unreachable or session unknown.
    #[error("{0}")]
    Provider(String),

    /// Session metadata does not reconstruct an order; the session was not
    /// created by this service.
    #[error("payment session metadata is incomplete: {0}")]
    BadMetadata(String),

    #[error("{0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Order fields reconstructed from session metadata (written by
/// `checkout::create_payment_session`).
struct MetadataOrder {
    order_number: String,
    customer_name: String,
    customer_email: String,
    customer_phone: String,
    pickup_time: String,
    special_instructions: Option<String>,
    items: Vec<CartItem>,
    totals: Totals,
}

fn parse_metadata(session: &RetrievedSession) -> Result<MetadataOrder, VerifyError> {
    let get = |key: &str| -> Result<String, VerifyError> {
        session
            .metadata
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| VerifyError::BadMetadata(format!("missing {key}")))
    };

    let items: Vec<CartItem> = session
        .metadata
        .get("items")
        .map(|raw| serde_json::from_str(raw))
        .transpose()
        .map_err(|e| VerifyError::BadMetadata(format!("items: {e}")))?
        .unwrap_or_default();

    let amount = |key: &str| -> f64 {
        session
            .metadata
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    };

    Ok(MetadataOrder {
        order_number: get("orderNumber")?,
        customer_name: get("customerName")?,
        customer_email: get("customerEmail")?,
        customer_phone: session
            .metadata
            .get("customerPhone")
            .cloned()
            .unwrap_or_default(),
        pickup_time: get("pickupTime")?,
        special_instructions: session
            .metadata
            .get("specialInstructions")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        items,
        totals: Totals {
            subtotal: amount("subtotal"),
            tax: amount("tax"),
            total: amount("total"),
        },
    })
}

fn verified_from_record(record: &OrderRecord, already_processed: bool) -> VerifiedOrder {
    VerifiedOrder {
        order_number: record.order_number.clone(),
        customer_name: record.customer_name.clone(),
        customer_email: record.customer_email.clone(),
        pickup_time: record.pickup_time.clone(),
        total: record.total,
        already_processed,
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verify a payment session and persist its order exactly once.
pub async fn verify_payment(
    db: &DbState,
    bus: &EventBus,
    mailer: &Arc<Mailer>,
    provider: &dyn PaymentProvider,
    session_id: &str,
) -> Result<VerifyOutcome, VerifyError> {
    let session = provider
        .retrieve_session(session_id)
        .await
        .map_err(VerifyError::Provider)?;

    if !session.is_paid() {
        info!(session_id, payment_status = %session.payment_status, "Payment not completed");
        return Ok(VerifyOutcome::NotPaid);
    }

    let metadata = parse_metadata(&session)?;

    // Idempotency check: a repeat call (page refresh, double invocation)
    // replays the original success payload without touching anything.
    if let Some(existing) = orders::find_by_order_number(db, &metadata.order_number)
        .map_err(VerifyError::Internal)?
    {
        info!(
            order_number = %existing.order_number,
            "Order already processed, returning cached result"
        );
        return Ok(VerifyOutcome::Verified(verified_from_record(
            &existing, true,
        )));
    }

    let new_order = NewOrder {
        order_number: metadata.order_number.clone(),
        customer_name: metadata.customer_name,
        customer_email: metadata.customer_email,
        customer_phone: metadata.customer_phone,
        items: metadata.items,
        totals: metadata.totals,
        status: OrderStatus::Paid,
        pickup_time: metadata.pickup_time,
        special_instructions: metadata.special_instructions,
    };

    match orders::insert_order(db, &new_order).map_err(VerifyError::Internal)? {
        InsertOutcome::Inserted(record) => {
            info!(order_number = %record.order_number, "Payment verified, order saved");
            bus.publish(BusEvent::OrderCreated {
                order_id: record.id.clone(),
                order_number: record.order_number.clone(),
            });

            // Notifications only after the first successful save; their
            // failure never changes the response.
            let mailer = Arc::clone(mailer);
            let notification = OrderNotification::from(&record);
            tokio::spawn(async move {
                mailer.send_order_notifications(&notification).await;
            });

            Ok(VerifyOutcome::Verified(verified_from_record(
                &record, false,
            )))
        }
        InsertOutcome::AlreadyExists(record) => {
            // A concurrent verification won the race between our lookup and
            // insert. Same terminal state, no second notification.
            warn!(
                order_number = %record.order_number,
                "Concurrent verification already saved this order"
            );
            Ok(VerifyOutcome::Verified(verified_from_record(
                &record, true,
            )))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
