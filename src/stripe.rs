//! Payment provider client.
//!
//! Thin HTTP wrapper over the hosted-checkout REST API (form-encoded
//! requests, JSON responses). The `PaymentProvider` trait is the seam the
//! checkout and verification services depend on, so their logic is
//! exercised in tests with an in-memory fake instead of the network.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Default timeout for provider requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const CURRENCY: &str = "cad";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One price line on the hosted payment page.
#[derive(Debug, Clone)]
pub struct LineItem {
    pub name: String,
    pub unit_amount_cents: i64,
    pub quantity: u32,
}

/// Everything needed to open a hosted checkout session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub line_items: Vec<LineItem>,
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Order-reconstructing payload; the single source of truth consumed by
    /// verification once payment completes.
    pub metadata: HashMap<String, String>,
}

/// A freshly created session: where to send the customer.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
}

/// A session as read back during verification.
#[derive(Debug, Clone)]
pub struct RetrievedSession {
    pub id: String,
    pub payment_status: String,
    pub metadata: HashMap<String, String>,
}

impl RetrievedSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

/// Seam between checkout/verification logic and the real provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_session(&self, request: &SessionRequest) -> Result<CreatedSession, String>;
    async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession, String>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(err: &reqwest::Error) -> String {
    if err.is_connect() {
        return "Cannot reach the payment provider".to_string();
    }
    if err.is_timeout() {
        return "Connection to the payment provider timed out".to_string();
    }
    format!("Network error communicating with the payment provider: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Payment provider API key is invalid or expired".to_string(),
        404 => "Payment session not found".to_string(),
        s if s >= 500 => format!("Payment provider server error (HTTP {s})"),
        s => format!("Unexpected response from payment provider (HTTP {s})"),
    }
}

fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(message) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return format!("{} (HTTP {})", message, status.as_u16());
        }
    }
    status_error(status)
}

// ---------------------------------------------------------------------------
// Form encoding
// ---------------------------------------------------------------------------

/// Flatten a session request into the provider's bracketed form fields.
fn build_session_form(request: &SessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        (
            "payment_method_types[0]".to_string(),
            "card".to_string(),
        ),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        (
            "customer_email".to_string(),
            request.customer_email.clone(),
        ),
    ];

    for (i, item) in request.line_items.iter().enumerate() {
        form.push((
            format!("line_items[{i}][price_data][currency]"),
            CURRENCY.to_string(),
        ));
        form.push((
            format!("line_items[{i}][price_data][product_data][name]"),
            item.name.clone(),
        ));
        form.push((
            format!("line_items[{i}][price_data][unit_amount]"),
            item.unit_amount_cents.to_string(),
        ));
        form.push((format!("line_items[{i}][quantity]"), item.quantity.to_string()));
    }

    let mut keys: Vec<&String> = request.metadata.keys().collect();
    keys.sort();
    for key in keys {
        form.push((format!("metadata[{key}]"), request.metadata[key].clone()));
    }

    form
}

fn session_from_json(json: &Value) -> Result<RetrievedSession, String> {
    let id = json
        .get("id")
        .and_then(Value::as_str)
        .ok_or("session response missing id")?
        .to_string();
    let payment_status = json
        .get("payment_status")
        .and_then(Value::as_str)
        .unwrap_or("unpaid")
        .to_string();
    let metadata = json
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(RetrievedSession {
        id,
        payment_status,
        metadata,
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct StripeClient {
    secret_key: String,
    api_base: String,
    client: Client,
}

impl StripeClient {
    pub fn new(secret_key: &str) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            secret_key: secret_key.to_string(),
            api_base: API_BASE.to_string(),
            client,
        })
    }

    async fn parse_response(resp: reqwest::Response) -> Result<Value, String> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_detail(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| format!("Invalid JSON from payment provider: {e}"))
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_session(&self, request: &SessionRequest) -> Result<CreatedSession, String> {
        let url = format!("{}/checkout/sessions", self.api_base);
        let form = build_session_form(request);

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&form)
            .send()
            .await
            .map_err(|e| friendly_error(&e))?;

        let json = Self::parse_response(resp).await?;
        let id = json
            .get("id")
            .and_then(Value::as_str)
            .ok_or("session create response missing id")?
            .to_string();
        let redirect_url = json
            .get("url")
            .and_then(Value::as_str)
            .ok_or("session create response missing url")?
            .to_string();

        info!(session_id = %id, "Checkout session created");
        Ok(CreatedSession {
            id,
            url: redirect_url,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession, String> {
        let url = format!("{}/checkout/sessions/{}", self.api_base, session_id);

        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| friendly_error(&e))?;

        let json = Self::parse_response(resp).await?;
        session_from_json(&json)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> SessionRequest {
        let mut metadata = HashMap::new();
        metadata.insert("orderNumber".to_string(), "TSO-X-1".to_string());
        metadata.insert("subtotal".to_string(), "18.5".to_string());
        SessionRequest {
            line_items: vec![
                LineItem {
                    name: "Jerk Chicken Dinner".to_string(),
                    unit_amount_cents: 1850,
                    quantity: 1,
                },
                LineItem {
                    name: "HST (13%)".to_string(),
                    unit_amount_cents: 241,
                    quantity: 1,
                },
            ],
            customer_email: "jane@example.com".to_string(),
            success_url: "https://x/payment-success?session_id={CHECKOUT_SESSION_ID}".to_string(),
            cancel_url: "https://x/checkout".to_string(),
            metadata,
        }
    }

    fn field<'a>(form: &'a [(String, String)], key: &str) -> Option<&'a str> {
        form.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_build_session_form_layout() {
        let form = build_session_form(&sample_request());

        assert_eq!(field(&form, "mode"), Some("payment"));
        assert_eq!(field(&form, "payment_method_types[0]"), Some("card"));
        assert_eq!(
            field(&form, "line_items[0][price_data][product_data][name]"),
            Some("Jerk Chicken Dinner")
        );
        assert_eq!(
            field(&form, "line_items[0][price_data][unit_amount]"),
            Some("1850")
        );
        assert_eq!(field(&form, "line_items[1][quantity]"), Some("1"));
        assert_eq!(
            field(&form, "line_items[1][price_data][product_data][name]"),
            Some("HST (13%)")
        );
        assert_eq!(field(&form, "metadata[orderNumber]"), Some("TSO-X-1"));
        assert_eq!(field(&form, "metadata[subtotal]"), Some("18.5"));
    }

    #[test]
    fn test_session_from_json() {
        let json = serde_json::json!({
            "id": "cs_test_123",
            "payment_status": "paid",
            "metadata": { "orderNumber": "TSO-X-1", "ignored": 5 }
        });
        let session = session_from_json(&json).expect("parse session");
        assert_eq!(session.id, "cs_test_123");
        assert!(session.is_paid());
        assert_eq!(
            session.metadata.get("orderNumber").map(String::as_str),
            Some("TSO-X-1")
        );
        // Non-string metadata values are dropped, not errors
        assert!(!session.metadata.contains_key("ignored"));
    }

    #[test]
    fn test_session_missing_payment_status_is_unpaid() {
        let json = serde_json::json!({ "id": "cs_test_456" });
        let session = session_from_json(&json).expect("parse session");
        assert!(!session.is_paid());
        assert_eq!(session.payment_status, "unpaid");
    }

    #[test]
    fn test_error_detail_prefers_provider_message() {
        let detail = error_detail(
            StatusCode::PAYMENT_REQUIRED,
            r#"{"error": {"message": "Your card was declined."}}"#,
        );
        assert_eq!(detail, "Your card was declined. (HTTP 402)");

        let fallback = error_detail(StatusCode::INTERNAL_SERVER_ERROR, "nonsense");
        assert!(fallback.contains("HTTP 500"));
    }
}
