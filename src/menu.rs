//! Menu availability layer.
//!
//! Menu rows live in the `menu_items` table and carry an availability flag
//! staff can toggle from the dashboard. Until staff have seeded the table,
//! reads fall back to the built-in menu so a fresh deployment is browsable
//! immediately. The first staff edit persists the fallback list wholesale,
//! keeping ids stable from then on.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::db::DbState;
use crate::events::{BusEvent, EventBus};

/// A menu entry as served to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub category: String,
    pub is_available: bool,
}

/// Built-in menu used until the table has rows: (id, name, price, category).
const FALLBACK_MENU: &[(&str, &str, f64, &str)] = &[
    ("jerk-chicken-rice", "Jerk Chicken, Rice & Peas", 7.50, "Lunch Specials"),
    ("doubles", "Doubles", 4.00, "Lunch Specials"),
    ("curry-chicken-lunch", "Curry Chicken", 14.99, "Lunch Specials"),
    ("vegetarian-roti", "Vegetarian ROTI", 14.99, "Lunch Specials"),
    ("oxtail-dinner", "Oxtail Dinner", 22.50, "Dinners"),
    ("curry-goat-dinner", "Curry Goat Dinner", 22.50, "Dinners"),
    ("jerk-chicken-dinner", "Jerk Chicken Dinner", 18.50, "Dinners"),
    ("curry-chicken-dinner", "Curry Chicken Dinner", 18.50, "Dinners"),
    ("fish-dinner", "Fish Dinner", 24.99, "Dinners"),
    ("roti-dinner", "ROTI Dinner", 18.50, "Dinners"),
    ("egusi-soup", "Egusi Soup", 7.99, "Soups"),
    ("goat-pepper-soup", "Goat Pepper Soup", 24.99, "Soups"),
    ("fried-plantain", "Fried Plantain", 4.50, "Sides"),
    ("plantain-chips", "Plantain Chips", 4.50, "Sides"),
    ("rice-side", "Rice", 4.50, "Sides"),
    ("sugar-cane-juice", "Sugar Cane Juice", 8.99, "Drinks"),
    ("bottle-water", "Bottle Water", 1.50, "Drinks"),
];

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// All menu items in display order. Falls back to the built-in list when
/// the table has no rows yet.
pub fn list_items(db: &DbState) -> Result<Vec<MenuItem>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let stored = query_all(&conn)?;
    if !stored.is_empty() {
        return Ok(stored);
    }
    Ok(fallback_items())
}

fn fallback_items() -> Vec<MenuItem> {
    FALLBACK_MENU
        .iter()
        .map(|(id, name, price, category)| MenuItem {
            id: (*id).to_string(),
            name: (*name).to_string(),
            price: *price,
            category: (*category).to_string(),
            is_available: true,
        })
        .collect()
}

fn query_all(conn: &Connection) -> Result<Vec<MenuItem>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, price, category, is_available
             FROM menu_items ORDER BY position, name",
        )
        .map_err(|e| format!("prepare menu query: {e}"))?;

    let rows = stmt
        .query_map([], |row| {
            Ok(MenuItem {
                id: row.get(0)?,
                name: row.get(1)?,
                price: row.get(2)?,
                category: row.get(3)?,
                is_available: row.get::<_, i64>(4)? != 0,
            })
        })
        .map_err(|e| format!("menu query: {e}"))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("menu rows: {e}"))
}

// ---------------------------------------------------------------------------
// Staff mutations
// ---------------------------------------------------------------------------

/// Toggle an item's availability. Seeds the fallback menu on first use so
/// the toggled id has a durable row. Returns the updated item, or `None`
/// for an unknown id.
pub fn set_availability(
    db: &DbState,
    bus: &EventBus,
    item_id: &str,
    is_available: bool,
) -> Result<Option<MenuItem>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let row_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM menu_items", [], |row| row.get(0))
        .map_err(|e| format!("count menu items: {e}"))?;
    if row_count == 0 {
        seed_fallback(&conn)?;
    }

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let changed = conn
        .execute(
            "UPDATE menu_items SET is_available = ?1, updated_at = ?2 WHERE id = ?3",
            params![is_available as i64, now, item_id],
        )
        .map_err(|e| format!("update menu availability: {e}"))?;

    if changed == 0 {
        return Ok(None);
    }

    let item = conn
        .query_row(
            "SELECT id, name, price, category, is_available FROM menu_items WHERE id = ?1",
            params![item_id],
            |row| {
                Ok(MenuItem {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                    category: row.get(3)?,
                    is_available: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .map_err(|e| format!("reload menu item: {e}"))?;

    if let Some(ref item) = item {
        info!(item_id = %item.id, is_available, "Menu availability updated");
        bus.publish(BusEvent::MenuItemChanged {
            item_id: item.id.clone(),
            is_available,
        });
    }

    Ok(item)
}

fn seed_fallback(conn: &Connection) -> Result<(), String> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    for (position, (id, name, price, category)) in FALLBACK_MENU.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO menu_items
                 (id, name, price, category, is_available, position, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)",
            params![id, name, price, category, position as i64, now],
        )
        .map_err(|e| format!("seed menu item {id}: {e}"))?;
    }
    info!(count = FALLBACK_MENU.len(), "Seeded menu from built-in list");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        crate::db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_empty_table_serves_fallback() {
        let db = test_db();
        let items = list_items(&db).expect("list");
        assert_eq!(items.len(), FALLBACK_MENU.len());
        assert!(items.iter().all(|i| i.is_available));
        assert!(items.iter().any(|i| i.id == "oxtail-dinner"));
    }

    #[test]
    fn test_set_availability_seeds_then_updates() {
        let db = test_db();
        let bus = EventBus::new();

        let item = set_availability(&db, &bus, "oxtail-dinner", false)
            .expect("toggle")
            .expect("known id");
        assert!(!item.is_available);

        // Table is now seeded; reads come from rows, not the fallback
        let items = list_items(&db).expect("list");
        assert_eq!(items.len(), FALLBACK_MENU.len());
        let oxtail = items.iter().find(|i| i.id == "oxtail-dinner").unwrap();
        assert!(!oxtail.is_available);
        let others_available = items
            .iter()
            .filter(|i| i.id != "oxtail-dinner")
            .all(|i| i.is_available);
        assert!(others_available);
    }

    #[test]
    fn test_unknown_item_is_none() {
        let db = test_db();
        let bus = EventBus::new();
        let result = set_availability(&db, &bus, "no-such-item", false).expect("toggle");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_toggle_publishes_event() {
        let db = test_db();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        set_availability(&db, &bus, "doubles", false)
            .expect("toggle")
            .expect("known id");

        match rx.recv().await.expect("event") {
            BusEvent::MenuItemChanged {
                item_id,
                is_available,
            } => {
                assert_eq!(item_id, "doubles");
                assert!(!is_available);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
