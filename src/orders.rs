//! Order store for The Small Orders.
//!
//! Owns the durable `orders` table: creation (both checkout paths land
//! here), the admin day view, status transitions, and acknowledgment. The
//! UNIQUE constraint on `order_number` doubles as the idempotency guard for
//! retried payment verification, so a constraint conflict is surfaced as a
//! distinct outcome rather than an error.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::pricing::Totals;
use crate::timezone;

/// Pickup slots offered at checkout. Labels, not timestamps; the kitchen
/// reads them relative to when the order arrives.
pub const PICKUP_TIMES: &[&str] = &[
    "ASAP (20-30 mins)",
    "30 minutes",
    "45 minutes",
    "1 hour",
    "1.5 hours",
    "2 hours",
];

/// Prefix on every order number.
const ORDER_NUMBER_PREFIX: &str = "TSO";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One ordered line item, stored as part of the order's JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartItem {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

/// Order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Completed,
    Cancelled,
    Paid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Paid => "paid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "preparing" => Some(OrderStatus::Preparing),
            "ready" => Some(OrderStatus::Ready),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "paid" => Some(OrderStatus::Paid),
            _ => None,
        }
    }
}

/// A persisted order as returned to handlers and the admin view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: String,
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub items: Vec<CartItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub status: String,
    pub pickup_time: String,
    pub special_instructions: Option<String>,
    pub acknowledged: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields required to create an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub items: Vec<CartItem>,
    pub totals: Totals,
    pub status: OrderStatus,
    pub pickup_time: String,
    pub special_instructions: Option<String>,
}

/// Result of an insert attempt keyed by order number.
#[derive(Debug)]
pub enum InsertOutcome {
    /// First insert; the caller owns follow-up side effects (notifications).
    Inserted(OrderRecord),
    /// The order number already had a row, either from an earlier call or a
    /// concurrent one that won the race. Side effects must not repeat.
    AlreadyExists(OrderRecord),
}

// ---------------------------------------------------------------------------
// Order numbers
// ---------------------------------------------------------------------------

/// Generate a collision-resistant order number:
/// `TSO-{millisecond timestamp, base36}-{4 random hex chars}`, uppercase.
pub fn generate_order_number() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        ORDER_NUMBER_PREFIX,
        to_base36(millis),
        random[..4].to_uppercase()
    )
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Insert a new order. A UNIQUE conflict on the order number is reported as
/// `AlreadyExists` with the surviving row, never as an error.
pub fn insert_order(db: &DbState, new_order: &NewOrder) -> Result<InsertOutcome, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let items_json =
        serde_json::to_string(&new_order.items).map_err(|e| format!("serialize items: {e}"))?;

    let result = conn.execute(
        "INSERT INTO orders (id, order_number, customer_name, customer_email,
                             customer_phone, items, subtotal, tax, total, status,
                             pickup_time, special_instructions, acknowledged,
                             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?13)",
        params![
            id,
            new_order.order_number,
            new_order.customer_name,
            new_order.customer_email,
            new_order.customer_phone,
            items_json,
            new_order.totals.subtotal,
            new_order.totals.tax,
            new_order.totals.total,
            new_order.status.as_str(),
            new_order.pickup_time,
            new_order.special_instructions,
            now,
        ],
    );

    match result {
        Ok(_) => {
            info!(
                order_number = %new_order.order_number,
                status = new_order.status.as_str(),
                total = new_order.totals.total,
                "Order created"
            );
            let record = query_by_order_number(&conn, &new_order.order_number)?
                .ok_or_else(|| "order vanished after insert".to_string())?;
            Ok(InsertOutcome::Inserted(record))
        }
        Err(e) if is_unique_violation(&e) => {
            info!(
                order_number = %new_order.order_number,
                "Order already exists, returning surviving row"
            );
            let record = query_by_order_number(&conn, &new_order.order_number)?
                .ok_or_else(|| format!("order number conflict without row: {e}"))?;
            Ok(InsertOutcome::AlreadyExists(record))
        }
        Err(e) => Err(format!("insert order: {e}")),
    }
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Look up an order by its order number.
pub fn find_by_order_number(
    db: &DbState,
    order_number: &str,
) -> Result<Option<OrderRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_by_order_number(&conn, order_number)
}

/// Look up an order by row id.
pub fn find_by_id(db: &DbState, order_id: &str) -> Result<Option<OrderRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![order_id],
        map_order_row,
    )
    .optional()
    .map_err(|e| format!("find order by id: {e}"))
}

/// Orders created during the current restaurant-local day, newest first.
pub fn list_today(db: &DbState, now: DateTime<Utc>) -> Result<Vec<OrderRecord>, String> {
    let (start, end) = timezone::toronto_day_bounds(now);
    let start = start.to_rfc3339_opts(SecondsFormat::Millis, true);
    let end = end.to_rfc3339_opts(SecondsFormat::Millis, true);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE created_at >= ?1 AND created_at < ?2
             ORDER BY created_at DESC"
        ))
        .map_err(|e| format!("prepare today query: {e}"))?;

    let rows = stmt
        .query_map(params![start, end], map_order_row)
        .map_err(|e| format!("today query: {e}"))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("today rows: {e}"))
}

/// All orders staff have not yet acknowledged, oldest first.
pub fn list_unacknowledged(db: &DbState) -> Result<Vec<OrderRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE acknowledged = 0
             ORDER BY created_at ASC"
        ))
        .map_err(|e| format!("prepare unacknowledged query: {e}"))?;

    let rows = stmt
        .query_map([], map_order_row)
        .map_err(|e| format!("unacknowledged query: {e}"))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("unacknowledged rows: {e}"))
}

/// Update an order's status. Returns the updated row, or `None` when the id
/// is unknown.
pub fn update_status(
    db: &DbState,
    order_id: &str,
    status: OrderStatus,
) -> Result<Option<OrderRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let changed = conn
        .execute(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_rfc3339(), order_id],
        )
        .map_err(|e| format!("update order status: {e}"))?;

    if changed == 0 {
        return Ok(None);
    }

    info!(order_id = %order_id, status = status.as_str(), "Order status updated");
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![order_id],
        map_order_row,
    )
    .optional()
    .map_err(|e| format!("reload order after status update: {e}"))
}

/// Mark an order acknowledged. One-way; re-acknowledging is a no-op that
/// still reports success. Returns false when the id is unknown.
pub fn acknowledge(db: &DbState, order_id: &str) -> Result<bool, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM orders WHERE id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("acknowledge lookup: {e}"))?;
    if exists.is_none() {
        return Ok(false);
    }

    conn.execute(
        "UPDATE orders SET acknowledged = 1, updated_at = ?1 WHERE id = ?2",
        params![now_rfc3339(), order_id],
    )
    .map_err(|e| format!("acknowledge order: {e}"))?;

    info!(order_id = %order_id, "Order acknowledged");
    Ok(true)
}

/// Count of orders awaiting acknowledgment.
pub fn unacknowledged_count(db: &DbState) -> Result<i64, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE acknowledged = 0",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("count unacknowledged: {e}"))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, order_number, customer_name, customer_email, customer_phone, \
     items, subtotal, tax, total, status, pickup_time, special_instructions, \
     acknowledged, created_at, updated_at";

fn query_by_order_number(
    conn: &Connection,
    order_number: &str,
) -> Result<Option<OrderRecord>, String> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = ?1"),
        params![order_number],
        map_order_row,
    )
    .optional()
    .map_err(|e| format!("find order by number: {e}"))
}

fn map_order_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    let items_json: String = row.get(5)?;
    // Tolerate malformed blobs from manual edits; an empty item list is
    // still a displayable order.
    let items = serde_json::from_str(&items_json).unwrap_or_default();
    Ok(OrderRecord {
        id: row.get(0)?,
        order_number: row.get(1)?,
        customer_name: row.get(2)?,
        customer_email: row.get(3)?,
        customer_phone: row.get(4)?,
        items,
        subtotal: row.get(6)?,
        tax: row.get(7)?,
        total: row.get(8)?,
        status: row.get(9)?,
        pickup_time: row.get(10)?,
        special_instructions: row.get(11)?,
        acknowledged: row.get::<_, i64>(12)? != 0,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::pricing;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn sample_order(order_number: &str) -> NewOrder {
        NewOrder {
            order_number: order_number.to_string(),
            customer_name: "Jane".to_string(),
            customer_email: "jane@example.com".to_string(),
            customer_phone: "519-555-0101".to_string(),
            items: vec![CartItem {
                id: "jerk-chicken".to_string(),
                name: "Jerk Chicken".to_string(),
                price: 18.5,
                quantity: 1,
            }],
            totals: pricing::totals_from_subtotal(18.5),
            status: OrderStatus::Pending,
            pickup_time: "30 minutes".to_string(),
            special_instructions: None,
        }
    }

    #[test]
    fn test_insert_and_fetch_roundtrip() {
        let db = test_db();
        let outcome = insert_order(&db, &sample_order("TSO-T1-AAAA")).expect("insert");

        let record = match outcome {
            InsertOutcome::Inserted(r) => r,
            InsertOutcome::AlreadyExists(_) => panic!("fresh insert reported as duplicate"),
        };
        assert_eq!(record.order_number, "TSO-T1-AAAA");
        assert_eq!(record.status, "pending");
        assert_eq!(record.subtotal, 18.5);
        assert_eq!(record.tax, 2.41);
        assert_eq!(record.total, 20.91);
        assert!(!record.acknowledged);
        assert_eq!(record.items.len(), 1);
        assert_eq!(record.items[0].name, "Jerk Chicken");

        let fetched = find_by_order_number(&db, "TSO-T1-AAAA")
            .expect("lookup")
            .expect("row exists");
        assert_eq!(fetched.id, record.id);
    }

    #[test]
    fn test_duplicate_order_number_is_already_exists() {
        let db = test_db();
        let first = insert_order(&db, &sample_order("TSO-T2-BBBB")).expect("first insert");
        let first_id = match first {
            InsertOutcome::Inserted(r) => r.id,
            InsertOutcome::AlreadyExists(_) => panic!("first insert reported as duplicate"),
        };

        // Same order number again, as a retried verification would produce
        let second = insert_order(&db, &sample_order("TSO-T2-BBBB")).expect("second insert");
        match second {
            InsertOutcome::AlreadyExists(r) => assert_eq!(r.id, first_id),
            InsertOutcome::Inserted(_) => panic!("duplicate insert should not succeed"),
        }

        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM orders WHERE order_number = 'TSO-T2-BBBB'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "exactly one physical row survives");
    }

    #[test]
    fn test_list_today_filters_by_toronto_day() {
        let db = test_db();
        for number in ["TSO-T3-0001", "TSO-T3-0002", "TSO-T3-0003"] {
            insert_order(&db, &sample_order(number)).expect("insert");
        }

        // Rewrite timestamps: one inside today's window, one yesterday, one
        // inside today but late Toronto evening (crosses UTC midnight).
        let now: DateTime<Utc> = "2026-08-07T15:00:00Z".parse().unwrap();
        let conn = db.conn.lock().unwrap();
        conn.execute_batch(
            "UPDATE orders SET created_at = '2026-08-07T15:00:00.000Z'
                WHERE order_number = 'TSO-T3-0001';
             UPDATE orders SET created_at = '2026-08-06T03:59:00.000Z'
                WHERE order_number = 'TSO-T3-0002';
             UPDATE orders SET created_at = '2026-08-08T03:30:00.000Z'
                WHERE order_number = 'TSO-T3-0003';",
        )
        .unwrap();
        drop(conn);

        let today = list_today(&db, now).expect("list today");
        let numbers: Vec<&str> = today.iter().map(|o| o.order_number.as_str()).collect();
        // Newest first; yesterday's order excluded
        assert_eq!(numbers, vec!["TSO-T3-0003", "TSO-T3-0001"]);
    }

    #[test]
    fn test_update_status_and_unknown_id() {
        let db = test_db();
        let record = match insert_order(&db, &sample_order("TSO-T4-CCCC")).expect("insert") {
            InsertOutcome::Inserted(r) => r,
            InsertOutcome::AlreadyExists(_) => panic!("duplicate"),
        };

        let updated = update_status(&db, &record.id, OrderStatus::Ready)
            .expect("update")
            .expect("row exists");
        assert_eq!(updated.status, "ready");

        let missing = update_status(&db, "no-such-id", OrderStatus::Ready).expect("update");
        assert!(missing.is_none());
    }

    #[test]
    fn test_acknowledge_removes_from_backlog() {
        let db = test_db();
        let a = match insert_order(&db, &sample_order("TSO-T5-DDDD")).expect("insert") {
            InsertOutcome::Inserted(r) => r,
            InsertOutcome::AlreadyExists(_) => panic!("duplicate"),
        };
        insert_order(&db, &sample_order("TSO-T5-EEEE")).expect("insert");

        assert_eq!(unacknowledged_count(&db).unwrap(), 2);
        assert!(acknowledge(&db, &a.id).expect("acknowledge"));
        assert_eq!(unacknowledged_count(&db).unwrap(), 1);

        let backlog = list_unacknowledged(&db).expect("backlog");
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].order_number, "TSO-T5-EEEE");

        // Re-acknowledging stays successful, unknown ids do not
        assert!(acknowledge(&db, &a.id).expect("re-acknowledge"));
        assert!(!acknowledge(&db, "no-such-id").expect("unknown id"));
    }

    #[test]
    fn test_order_number_shape() {
        let a = generate_order_number();
        let b = generate_order_number();
        assert!(a.starts_with("TSO-"));
        assert_eq!(a.split('-').count(), 3);
        assert_ne!(a, b, "random suffix should differ");
        let suffix = a.split('-').next_back().unwrap();
        assert_eq!(suffix.len(), 4);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(OrderStatus::parse(" Ready "), Some(OrderStatus::Ready));
        assert_eq!(OrderStatus::parse("paid"), Some(OrderStatus::Paid));
        assert_eq!(OrderStatus::parse("bogus"), None);
    }
}
