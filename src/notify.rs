//! Notification dispatch.
//!
//! Formats the customer confirmation and the kitchen alert for a new order
//! and hands them to the email provider. Strictly best-effort: by the time
//! anything here runs the order is already durable, so every failure is
//! logged and swallowed. Also relays contact-form messages to the staff
//! inbox with the same contract.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::orders::{CartItem, OrderRecord};

const API_BASE: &str = "https://api.resend.com";

/// Email sends get a shorter leash than payment calls; nobody is waiting
/// on them.
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything needed to compose both order emails.
#[derive(Debug, Clone)]
pub struct OrderNotification {
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub items: Vec<CartItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub pickup_time: String,
    pub special_instructions: Option<String>,
}

impl From<&OrderRecord> for OrderNotification {
    fn from(order: &OrderRecord) -> Self {
        Self {
            order_number: order.order_number.clone(),
            customer_name: order.customer_name.clone(),
            customer_email: order.customer_email.clone(),
            customer_phone: order.customer_phone.clone(),
            items: order.items.clone(),
            subtotal: order.subtotal,
            tax: order.tax,
            total: order.total,
            pickup_time: order.pickup_time.clone(),
            special_instructions: order.special_instructions.clone(),
        }
    }
}

/// Email provider client. A missing API key turns every send into a logged
/// no-op so the ordering flow never depends on email configuration.
pub struct Mailer {
    api_key: Option<String>,
    api_base: String,
    chef_email: String,
    restaurant_name: String,
    restaurant_address: String,
    client: Client,
}

impl Mailer {
    pub fn from_config(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            api_key: config.resend_api_key.clone(),
            api_base: API_BASE.to_string(),
            chef_email: config.chef_email.clone(),
            restaurant_name: config.restaurant_name.clone(),
            restaurant_address: config.restaurant_address.clone(),
            client,
        }
    }

    /// Send the customer confirmation and the kitchen alert. Never fails
    /// the caller; partial delivery (one of two emails) is acceptable.
    pub async fn send_order_notifications(&self, notification: &OrderNotification) {
        let Some(api_key) = self.api_key.as_deref() else {
            warn!(
                order_number = %notification.order_number,
                "Email provider not configured; skipping order notifications"
            );
            return;
        };

        let customer_subject = format!(
            "Order Confirmed - {} - {}",
            notification.order_number, self.restaurant_name
        );
        let customer_body = customer_email_body(
            notification,
            &self.restaurant_name,
            &self.restaurant_address,
        );
        match self
            .send_email(
                api_key,
                &notification.customer_email,
                &customer_subject,
                &customer_body,
            )
            .await
        {
            Ok(()) => info!(
                order_number = %notification.order_number,
                "Customer confirmation sent"
            ),
            Err(e) => error!(
                order_number = %notification.order_number,
                error = %e,
                "Customer confirmation failed"
            ),
        }

        let staff_subject = format!(
            "New Order {} - pickup {}",
            notification.order_number, notification.pickup_time
        );
        let staff_body = staff_email_body(notification);
        match self
            .send_email(api_key, &self.chef_email, &staff_subject, &staff_body)
            .await
        {
            Ok(()) => info!(
                order_number = %notification.order_number,
                "Kitchen alert sent"
            ),
            Err(e) => error!(
                order_number = %notification.order_number,
                error = %e,
                "Kitchen alert failed"
            ),
        }
    }

    /// Relay a contact-form message to the staff inbox.
    pub async fn send_contact_message(&self, name: &str, email: &str, message: &str) {
        let Some(api_key) = self.api_key.as_deref() else {
            warn!("Email provider not configured; dropping contact message");
            return;
        };

        let subject = format!("Website message from {name}");
        let body = format!("From: {name} <{email}>\n\n{message}\n");
        match self
            .send_email(api_key, &self.chef_email, &subject, &body)
            .await
        {
            Ok(()) => info!("Contact message relayed"),
            Err(e) => error!(error = %e, "Contact message relay failed"),
        }
    }

    async fn send_email(
        &self,
        api_key: &str,
        to: &str,
        subject: &str,
        text: &str,
    ) -> Result<(), String> {
        let url = format!("{}/emails", self.api_base);
        let payload = json!({
            "from": format!("{} <orders@thesmall.app>", self.restaurant_name),
            "to": [to],
            "subject": subject,
            "text": text,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("email send: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("email provider HTTP {}: {}", status.as_u16(), body.trim()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message composition
// ---------------------------------------------------------------------------

fn format_order_lines(items: &[CartItem]) -> String {
    items
        .iter()
        .map(|item| {
            format!(
                "  {}x {} - ${:.2}",
                item.quantity,
                item.name,
                crate::pricing::line_total(item.price, item.quantity)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn customer_email_body(
    notification: &OrderNotification,
    restaurant_name: &str,
    restaurant_address: &str,
) -> String {
    let mut body = format!(
        "Hi {},\n\n\
         Thanks for your order at {}!\n\n\
         Order {}\n\n\
         {}\n\n\
         Subtotal: ${:.2}\n\
         HST (13%): ${:.2}\n\
         Total: ${:.2}\n\n\
         Pickup time: {}\n\
         Pickup location: {}\n",
        notification.customer_name,
        restaurant_name,
        notification.order_number,
        format_order_lines(&notification.items),
        notification.subtotal,
        notification.tax,
        notification.total,
        notification.pickup_time,
        restaurant_address,
    );
    if let Some(instructions) = notification
        .special_instructions
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        body.push_str(&format!("\nSpecial instructions: {instructions}\n"));
    }
    body.push_str("\nSee you soon!\n");
    body
}

fn staff_email_body(notification: &OrderNotification) -> String {
    let mut body = format!(
        "New order {}\n\n\
         Customer: {} ({}, {})\n\
         Pickup: {}\n\n\
         {}\n\n\
         Subtotal: ${:.2}\n\
         HST (13%): ${:.2}\n\
         Total: ${:.2}\n",
        notification.order_number,
        notification.customer_name,
        notification.customer_email,
        notification.customer_phone,
        notification.pickup_time,
        format_order_lines(&notification.items),
        notification.subtotal,
        notification.tax,
        notification.total,
    );
    if let Some(instructions) = notification
        .special_instructions
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        body.push_str(&format!("\nSpecial instructions: {instructions}\n"));
    }
    body
}

// ===========================================================================
// Tests
// ===========================================================================
