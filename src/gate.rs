//! Pickup availability gate.
//!
//! A single shared boolean controlling whether new online orders are
//! accepted. Stored in the settings table (category "store", key
//! "pickup_enabled"), mutated only through the authenticated staff
//! endpoint, and pushed to every connected client over the event bus so
//! open tabs converge without polling. Absent row means open; a fresh
//! deployment should take orders.

use serde::Serialize;

use crate::db::{self, DbState};
use crate::events::{BusEvent, EventBus};

const CATEGORY: &str = "store";
const KEY: &str = "pickup_enabled";

/// Gate value plus its last-modified timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    pub enabled: bool,
    pub updated_at: Option<String>,
}

/// Whether online ordering is currently open.
pub fn is_enabled(db: &DbState) -> Result<bool, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(db::get_setting(&conn, CATEGORY, KEY)
        .map(|v| v == "true")
        .unwrap_or(true))
}

/// Gate value with its timestamp, for the public settings endpoint.
pub fn status(db: &DbState) -> Result<GateStatus, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    match db::get_setting_with_timestamp(&conn, CATEGORY, KEY)? {
        Some((value, updated_at)) => Ok(GateStatus {
            enabled: value == "true",
            updated_at: Some(updated_at),
        }),
        None => Ok(GateStatus {
            enabled: true,
            updated_at: None,
        }),
    }
}

/// Flip the gate and notify subscribers. Staff-only; callers enforce auth.
pub fn set_enabled(db: &DbState, bus: &EventBus, enabled: bool) -> Result<GateStatus, String> {
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        db::set_setting(
            &conn,
            CATEGORY,
            KEY,
            if enabled { "true" } else { "false" },
        )?;
    }

    tracing::info!(enabled, "Pickup gate updated");
    bus.publish(BusEvent::PickupGateChanged { enabled });
    status(db)
}

// ===========================================================================
// Tests
// ===========================================================================
