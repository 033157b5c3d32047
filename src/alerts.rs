//! Admin alert engine.
//!
//! Makes sure staff cannot silently miss a new order. The engine watches
//! the event bus for order inserts, refetches the authoritative
//! unacknowledged backlog from the store (the event payload is only a
//! hint), and drives audible alert signals onto the bus for the admin
//! dashboard: an immediate bounded repeat sequence when the backlog grows,
//! re-armed on a slower cadence while anything remains unacknowledged.
//!
//! Signals are only emitted after staff arm audio once per process
//! (browser autoplay rules make the matching client gesture explicit
//! anyway). Acknowledging an order cancels the in-flight sequence; all
//! timers hang off one shutdown token so teardown never leaks a beep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::DbState;
use crate::events::{BusEvent, EventBus};
use crate::orders;

/// Signals per bounded repeat sequence.
pub const REPEAT_PLAYS: u32 = 5;
/// Gap between signals inside a sequence.
const REPEAT_INTERVAL: Duration = Duration::from_secs(3);
/// Re-trigger cadence while the backlog is non-empty.
const REARM_INTERVAL: Duration = Duration::from_secs(60);

struct EngineState {
    audio_enabled: bool,
    backlog: HashSet<String>,
    previous_count: usize,
    cycle: Option<CancellationToken>,
    cadence: Option<CancellationToken>,
}

pub struct AlertEngine {
    db: Arc<DbState>,
    bus: EventBus,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
}

impl AlertEngine {
    pub fn new(db: Arc<DbState>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            state: Mutex::new(EngineState {
                audio_enabled: false,
                backlog: HashSet::new(),
                previous_count: 0,
                cycle: None,
                cadence: None,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to order-insert events and keep the backlog current.
    /// Separate from construction so tests can drive `refresh` directly.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            info!("Alert engine watching for new orders");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(BusEvent::OrderCreated { order_number, .. }) => {
                            info!(order_number = %order_number, "New order event received");
                            if let Err(e) = engine.refresh() {
                                warn!("Alert backlog refresh failed: {e}");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Alert engine lagged, refreshing backlog");
                            if let Err(e) = engine.refresh() {
                                warn!("Alert backlog refresh failed: {e}");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// One-time arming gesture. Does not play anything by itself; it only
    /// unlocks future sequences and the re-arm cadence for an existing
    /// backlog.
    pub fn enable_audio(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("alert state poisoned");
        if state.audio_enabled {
            return;
        }
        state.audio_enabled = true;
        info!("Audio alerts enabled");
        if !state.backlog.is_empty() {
            self.ensure_cadence(&mut state);
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.state.lock().expect("alert state poisoned").audio_enabled
    }

    pub fn backlog_count(&self) -> usize {
        self.state.lock().expect("alert state poisoned").backlog.len()
    }

    /// Refetch the unacknowledged backlog from the store and react to
    /// growth with a fresh repeat sequence.
    pub fn refresh(self: &Arc<Self>) -> Result<usize, String> {
        let unacknowledged = orders::list_unacknowledged(&self.db)?;
        let ids: HashSet<String> = unacknowledged.into_iter().map(|o| o.id).collect();
        let count = ids.len();

        let mut state = self.state.lock().expect("alert state poisoned");
        let grew = count > state.previous_count;
        state.backlog = ids;
        state.previous_count = count;

        if state.audio_enabled && grew {
            self.spawn_cycle(&mut state);
        }
        if state.audio_enabled && count > 0 {
            self.ensure_cadence(&mut state);
        }
        if count == 0 {
            Self::stop_cadence(&mut state);
        }

        Ok(count)
    }

    /// Acknowledge one order: durable flag write, optimistic local removal,
    /// and cancellation of the in-flight repeat sequence. Returns false for
    /// unknown ids.
    pub fn acknowledge(&self, order_id: &str) -> Result<bool, String> {
        if !orders::acknowledge(&self.db, order_id)? {
            return Ok(false);
        }

        let mut state = self.state.lock().expect("alert state poisoned");
        state.backlog.remove(order_id);
        state.previous_count = state.backlog.len();

        if let Some(cycle) = state.cycle.take() {
            cycle.cancel();
        }
        if state.backlog.is_empty() {
            Self::stop_cadence(&mut state);
        }
        drop(state);

        self.bus.publish(BusEvent::OrderAcknowledged {
            order_id: order_id.to_string(),
        });
        Ok(true)
    }

    /// Cancel every timer owned by the engine.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock().expect("alert state poisoned");
        if let Some(cycle) = state.cycle.take() {
            cycle.cancel();
        }
        Self::stop_cadence(&mut state);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Start a bounded repeat sequence, replacing any in-flight one. The
    /// sequence runs to its end regardless of backlog changes; only
    /// cancellation stops it early.
    fn spawn_cycle(&self, state: &mut EngineState) {
        if let Some(previous) = state.cycle.take() {
            previous.cancel();
        }
        let token = self.shutdown.child_token();
        state.cycle = Some(token.clone());

        let bus = self.bus.clone();
        tokio::spawn(async move {
            for play in 1..=REPEAT_PLAYS {
                if token.is_cancelled() {
                    break;
                }
                bus.publish(BusEvent::AlertSignal {
                    play,
                    of: REPEAT_PLAYS,
                });
                if play < REPEAT_PLAYS {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(REPEAT_INTERVAL) => {}
                    }
                }
            }
        });
    }

    /// Keep one slow re-arm loop alive while the backlog is outstanding.
    fn ensure_cadence(self: &Arc<Self>, state: &mut EngineState) {
        if state.cadence.is_some() {
            return;
        }
        let token = self.shutdown.child_token();
        state.cadence = Some(token.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(REARM_INTERVAL) => engine.retrigger(),
                }
            }
        });
    }

    fn stop_cadence(state: &mut EngineState) {
        if let Some(cadence) = state.cadence.take() {
            cadence.cancel();
        }
    }

    fn retrigger(&self) {
        let mut state = self.state.lock().expect("alert state poisoned");
        if state.audio_enabled && !state.backlog.is_empty() {
            info!(
                backlog = state.backlog.len(),
                "Backlog still unacknowledged, repeating alert"
            );
            self.spawn_cycle(&mut state);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{CartItem, InsertOutcome, NewOrder, OrderStatus};
    use crate::pricing;
    use rusqlite::Connection;
    use tokio::time::timeout;

    fn test_db() -> Arc<DbState> {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        crate::db::run_migrations_for_test(&conn);
        Arc::new(DbState {
            conn: Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        })
    }

    fn insert_test_order(db: &DbState, order_number: &str) -> String {
        let outcome = orders::insert_order(
            db,
            &NewOrder {
                order_number: order_number.to_string(),
                customer_name: "Jane".to_string(),
                customer_email: "jane@example.com".to_string(),
                customer_phone: "555-0101".to_string(),
                items: vec![CartItem {
                    id: "doubles".to_string(),
                    name: "Doubles".to_string(),
                    price: 4.0,
                    quantity: 2,
                }],
                totals: pricing::totals_from_subtotal(8.0),
                status: OrderStatus::Pending,
                pickup_time: "30 minutes".to_string(),
                special_instructions: None,
            },
        )
        .expect("insert order");
        match outcome {
            InsertOutcome::Inserted(record) => record.id,
            InsertOutcome::AlreadyExists(_) => panic!("fresh order number collided"),
        }
    }

    /// Receive bus events until the next alert signal, skipping unrelated
    /// event types.
    async fn next_signal(rx: &mut broadcast::Receiver<BusEvent>) -> (u32, u32) {
        loop {
            match rx.recv().await.expect("bus open") {
                BusEvent::AlertSignal { play, of } => return (play, of),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_until_audio_enabled() {
        let db = test_db();
        let bus = EventBus::new();
        let engine = AlertEngine::new(db.clone(), bus.clone());
        let mut rx = bus.subscribe();

        insert_test_order(&db, "TSO-A1-0001");
        assert_eq!(engine.refresh().expect("refresh"), 1);

        // No cycle was spawned; the only way to see a signal would be a
        // pending timer, so a bounded wait must elapse empty.
        let waited = timeout(Duration::from_secs(120), next_signal(&mut rx)).await;
        assert!(waited.is_err(), "unarmed engine must not emit signals");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_repeat_then_cadence_restart() {
        let db = test_db();
        let bus = EventBus::new();
        let engine = AlertEngine::new(db.clone(), bus.clone());
        let mut rx = bus.subscribe();

        engine.enable_audio();
        insert_test_order(&db, "TSO-A2-0001");
        engine.refresh().expect("refresh");

        // Full bounded sequence: plays 1..=5
        for expected in 1..=REPEAT_PLAYS {
            let (play, of) = next_signal(&mut rx).await;
            assert_eq!(play, expected);
            assert_eq!(of, REPEAT_PLAYS);
        }

        // Backlog still unacknowledged: the 60 s cadence starts a fresh
        // sequence from play 1.
        let (play, _) = next_signal(&mut rx).await;
        assert_eq!(play, 1, "cadence should restart the bounded sequence");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_halts_cycle_and_cadence() {
        let db = test_db();
        let bus = EventBus::new();
        let engine = AlertEngine::new(db.clone(), bus.clone());
        let mut rx = bus.subscribe();

        engine.enable_audio();
        let order_id = insert_test_order(&db, "TSO-A3-0001");
        engine.refresh().expect("refresh");

        let (play, _) = next_signal(&mut rx).await;
        assert_eq!(play, 1);

        assert!(engine.acknowledge(&order_id).expect("acknowledge"));
        assert_eq!(engine.backlog_count(), 0);

        // Durable flag is set
        let record = orders::find_by_id(&db, &order_id)
            .expect("lookup")
            .expect("row exists");
        assert!(record.acknowledged);

        // Neither the rest of the cycle nor the cadence may fire again
        let waited = timeout(Duration::from_secs(180), next_signal(&mut rx)).await;
        assert!(waited.is_err(), "acknowledged backlog must fall silent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_order_restarts_sequence_while_backlog_remains() {
        let db = test_db();
        let bus = EventBus::new();
        let engine = AlertEngine::new(db.clone(), bus.clone());
        let mut rx = bus.subscribe();

        engine.enable_audio();
        insert_test_order(&db, "TSO-A4-0001");
        engine.refresh().expect("refresh");

        let (play, _) = next_signal(&mut rx).await;
        assert_eq!(play, 1);
        let (play, _) = next_signal(&mut rx).await;
        assert_eq!(play, 2);

        // Second order arrives mid-sequence: backlog grows, sequence restarts
        insert_test_order(&db, "TSO-A4-0002");
        assert_eq!(engine.refresh().expect("refresh"), 2);

        let (play, _) = next_signal(&mut rx).await;
        assert_eq!(play, 1, "new arrival should restart the repeat sequence");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_unknown_id() {
        let db = test_db();
        let bus = EventBus::new();
        let engine = AlertEngine::new(db, bus);
        assert!(!engine.acknowledge("no-such-order").expect("acknowledge"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all_timers() {
        let db = test_db();
        let bus = EventBus::new();
        let engine = AlertEngine::new(db.clone(), bus.clone());
        let mut rx = bus.subscribe();

        engine.enable_audio();
        insert_test_order(&db, "TSO-A5-0001");
        engine.refresh().expect("refresh");

        let (play, _) = next_signal(&mut rx).await;
        assert_eq!(play, 1);

        engine.shutdown();
        let waited = timeout(Duration::from_secs(180), next_signal(&mut rx)).await;
        assert!(waited.is_err(), "shutdown must cancel pending timers");
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_subscription_drives_refresh() {
        let db = test_db();
        let bus = EventBus::new();
        let engine = AlertEngine::new(db.clone(), bus.clone());
        engine.start();
        engine.enable_audio();

        let mut rx = bus.subscribe();
        let order_id = insert_test_order(&db, "TSO-A6-0001");
        bus.publish(BusEvent::OrderCreated {
            order_id,
            order_number: "TSO-A6-0001".to_string(),
        });

        let (play, of) = next_signal(&mut rx).await;
        assert_eq!((play, of), (1, REPEAT_PLAYS));
        assert_eq!(engine.backlog_count(), 1);

        engine.shutdown();
    }
}
