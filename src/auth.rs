//! PIN-based staff authentication with bcrypt.
//!
//! Staff mutations (order status, acknowledgment, pickup gate, menu
//! availability) require a session token obtained by PIN login. PIN hashes
//! live in the SQLite `settings` table (category "staff", keys
//! "admin_pin_hash" / "staff_pin_hash"). Sessions are kept in memory and
//! presented as bearer tokens; the `staff_sessions` table only records
//! logins for audit.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 2;
const LOCKOUT_ATTEMPTS_KEY: &str = "lockout_attempts";
const LOCKOUT_LAST_ATTEMPT_KEY: &str = "lockout_last_attempt";

/// Permissions granted to administrators.
const ADMIN_PERMISSIONS: &[&str] = &[
    "view_orders",
    "update_order_status",
    "acknowledge_order",
    "manage_pickup_gate",
    "manage_menu",
    "manage_staff",
];

/// Permissions granted to regular staff.
const STAFF_PERMISSIONS: &[&str] = &[
    "view_orders",
    "update_order_status",
    "acknowledge_order",
    "manage_pickup_gate",
    "manage_menu",
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An active staff session.
#[derive(Clone, Debug)]
pub struct StaffSession {
    pub session_id: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub login_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl StaffSession {
    /// Check whether this session has expired (inactivity or max duration).
    fn is_expired(&self) -> bool {
        let now = Utc::now();
        if now >= self.expires_at {
            return true;
        }
        if now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES) {
            return true;
        }
        false
    }
}

/// Lockout tracking entry.
struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// Shared authentication state.
pub struct AuthState {
    sessions: Mutex<HashMap<String, StaffSession>>,
    lockout: Mutex<LockoutEntry>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lockout: Mutex::new(LockoutEntry {
                attempts: 0,
                last_attempt: Utc::now(),
            }),
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum LoginError {
    /// Too many failed attempts recently.
    Locked,
    InvalidPin,
    Internal(String),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Check whether logins are currently locked out.
fn check_lockout(lockout: &LockoutEntry) -> Result<(), LoginError> {
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        let elapsed = Utc::now() - lockout.last_attempt;
        if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
            return Err(LoginError::Locked);
        }
        // Lockout period has elapsed — will be reset on next successful login
    }
    Ok(())
}

/// Record a failed login attempt.
fn record_failure(lockout: &mut LockoutEntry) {
    lockout.attempts += 1;
    lockout.last_attempt = Utc::now();
    warn!(attempts = lockout.attempts, "failed login attempt");
}

/// Reset the lockout counter (on successful login).
fn reset_lockout(lockout: &mut LockoutEntry) {
    lockout.attempts = 0;
    lockout.last_attempt = Utc::now();
}

/// Load persisted lockout state from settings.
fn load_lockout_from_db(conn: &rusqlite::Connection) -> LockoutEntry {
    let attempts = db::get_setting(conn, "staff", LOCKOUT_ATTEMPTS_KEY)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(conn, "staff", LOCKOUT_LAST_ATTEMPT_KEY)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    LockoutEntry {
        attempts,
        last_attempt,
    }
}

/// Persist lockout state in settings.
fn persist_lockout_to_db(conn: &rusqlite::Connection, lockout: &LockoutEntry) {
    let _ = db::set_setting(
        conn,
        "staff",
        LOCKOUT_ATTEMPTS_KEY,
        &lockout.attempts.to_string(),
    );
    let _ = db::set_setting(
        conn,
        "staff",
        LOCKOUT_LAST_ATTEMPT_KEY,
        &lockout.last_attempt.to_rfc3339(),
    );
}

/// Create a new session and register it in the auth state.
fn create_session(auth: &AuthState, role: &str) -> StaffSession {
    let now = Utc::now();
    let permissions: Vec<String> = if role == "admin" {
        ADMIN_PERMISSIONS.iter().map(|s| s.to_string()).collect()
    } else {
        STAFF_PERMISSIONS.iter().map(|s| s.to_string()).collect()
    };

    let session = StaffSession {
        session_id: Uuid::new_v4().to_string(),
        role: role.to_string(),
        permissions,
        login_time: now,
        last_activity: now,
        expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
    };

    let mut sessions = auth.sessions.lock().expect("auth sessions poisoned");
    sessions.insert(session.session_id.clone(), session.clone());
    session
}

/// Record the login in the audit table. Best-effort.
fn audit_login(conn: &rusqlite::Connection, session: &StaffSession) {
    let _ = conn.execute(
        "INSERT INTO staff_sessions (id, role) VALUES (?1, ?2)",
        rusqlite::params![session.session_id, session.role],
    );
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

/// Whether any PIN has been configured yet. First-run setup is open until
/// then; afterwards changing PINs requires an admin session.
pub fn pin_configured(db: &DbState) -> Result<bool, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(db::get_setting(&conn, "staff", "admin_pin_hash").is_some()
        || db::get_setting(&conn, "staff", "staff_pin_hash").is_some())
}

/// Validate, hash, and store admin/staff PINs.
pub fn setup_pin(
    db: &DbState,
    admin_pin: Option<&str>,
    staff_pin: Option<&str>,
) -> Result<(), String> {
    if admin_pin.is_none() && staff_pin.is_none() {
        return Err("At least one PIN (adminPin or staffPin) is required".into());
    }

    // Validate: numeric, at least 4 digits
    fn validate_pin(pin: &str, label: &str) -> Result<(), String> {
        if pin.len() < 4 {
            return Err(format!("{label} must be at least 4 digits"));
        }
        if !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("{label} must contain only digits"));
        }
        Ok(())
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    if let Some(pin) = admin_pin {
        validate_pin(pin, "Admin PIN")?;
        let hash = bcrypt::hash(pin, bcrypt::DEFAULT_COST)
            .map_err(|e| format!("Failed to hash admin PIN: {e}"))?;
        db::set_setting(&conn, "staff", "admin_pin_hash", &hash)?;
        info!("admin PIN set");
    }

    if let Some(pin) = staff_pin {
        validate_pin(pin, "Staff PIN")?;
        let hash = bcrypt::hash(pin, bcrypt::DEFAULT_COST)
            .map_err(|e| format!("Failed to hash staff PIN: {e}"))?;
        db::set_setting(&conn, "staff", "staff_pin_hash", &hash)?;
        info!("staff PIN set");
    }

    Ok(())
}

/// Verify a PIN against stored hashes and create a session.
pub fn login(db: &DbState, auth: &AuthState, pin: &str) -> Result<StaffSession, LoginError> {
    let pin = pin.trim();
    if pin.is_empty() {
        return Err(LoginError::InvalidPin);
    }

    let conn = db
        .conn
        .lock()
        .map_err(|e| LoginError::Internal(e.to_string()))?;

    // Synchronize lockout state from durable storage so restarts do not
    // reset the counter.
    {
        let mut lockout = auth.lockout.lock().expect("auth lockout poisoned");
        *lockout = load_lockout_from_db(&conn);
        check_lockout(&lockout)?;
    }

    let admin_hash = db::get_setting(&conn, "staff", "admin_pin_hash");
    let staff_hash = db::get_setting(&conn, "staff", "staff_pin_hash");

    // Try admin PIN first
    if let Some(ref hash) = admin_hash {
        if bcrypt::verify(pin, hash).unwrap_or(false) {
            let mut lockout = auth.lockout.lock().expect("auth lockout poisoned");
            reset_lockout(&mut lockout);
            persist_lockout_to_db(&conn, &lockout);
            info!("admin login successful");
            let session = create_session(auth, "admin");
            audit_login(&conn, &session);
            return Ok(session);
        }
    }

    // Try staff PIN
    if let Some(ref hash) = staff_hash {
        if bcrypt::verify(pin, hash).unwrap_or(false) {
            let mut lockout = auth.lockout.lock().expect("auth lockout poisoned");
            reset_lockout(&mut lockout);
            persist_lockout_to_db(&conn, &lockout);
            info!("staff login successful");
            let session = create_session(auth, "staff");
            audit_login(&conn, &session);
            return Ok(session);
        }
    }

    // Neither matched
    let mut lockout = auth.lockout.lock().expect("auth lockout poisoned");
    record_failure(&mut lockout);
    persist_lockout_to_db(&conn, &lockout);
    Err(LoginError::InvalidPin)
}

/// Invalidate a session token.
pub fn logout(auth: &AuthState, session_id: &str) {
    let mut sessions = auth.sessions.lock().expect("auth sessions poisoned");
    if sessions.remove(session_id).is_some() {
        info!(session_id = %session_id, "session logged out");
    }
}

/// Resolve a bearer token into a live session, refreshing its inactivity
/// timer. Expired sessions are evicted.
pub fn validate_session(auth: &AuthState, session_id: &str) -> Option<StaffSession> {
    let mut sessions = auth.sessions.lock().expect("auth sessions poisoned");
    let expired = match sessions.get_mut(session_id) {
        Some(session) if !session.is_expired() => {
            session.last_activity = Utc::now();
            return Some(session.clone());
        }
        Some(_) => true,
        None => false,
    };
    if expired {
        sessions.remove(session_id);
    }
    None
}

/// Whether the session behind a token holds a permission.
pub fn has_permission(auth: &AuthState, session_id: &str, permission: &str) -> bool {
    validate_session(auth, session_id)
        .map(|s| s.permissions.iter().any(|p| p == permission))
        .unwrap_or(false)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::path::PathBuf;

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
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_setup_and_login_roles() {
        let db = test_db();
        let auth = AuthState::new();

        assert!(!pin_configured(&db).unwrap());
        setup_pin(&db, Some("1234"), Some("5678")).expect("setup pins");
        assert!(pin_configured(&db).unwrap());

        let admin = login(&db, &auth, "1234").expect("admin login");
        assert_eq!(admin.role, "admin");
        assert!(admin.permissions.iter().any(|p| p == "manage_staff"));

        let staff = login(&db, &auth, "5678").expect("staff login");
        assert_eq!(staff.role, "staff");
        assert!(!staff.permissions.iter().any(|p| p == "manage_staff"));
        assert!(staff.permissions.iter().any(|p| p == "acknowledge_order"));
    }

    #[test]
    fn test_setup_pin_validation() {
        let db = test_db();
        assert!(setup_pin(&db, None, None).is_err());
        assert!(setup_pin(&db, Some("12"), None).is_err());
        assert!(setup_pin(&db, Some("12ab"), None).is_err());
    }

    #[test]
    fn test_invalid_pin_and_lockout() {
        let db = test_db();
        let auth = AuthState::new();
        setup_pin(&db, Some("1234"), None).expect("setup");

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = login(&db, &auth, "0000").expect_err("wrong pin");
            assert!(matches!(err, LoginError::InvalidPin));
        }

        // Locked out now, even with the correct PIN
        let err = login(&db, &auth, "1234").expect_err("locked out");
        assert!(matches!(err, LoginError::Locked));
    }

    #[test]
    fn test_lockout_survives_restart() {
        let db = test_db();
        setup_pin(&db, Some("1234"), None).expect("setup");

        {
            let auth = AuthState::new();
            for _ in 0..MAX_FAILED_ATTEMPTS {
                let _ = login(&db, &auth, "0000");
            }
        }

        // Fresh in-memory state, same database: still locked
        let auth = AuthState::new();
        let err = login(&db, &auth, "1234").expect_err("locked after restart");
        assert!(matches!(err, LoginError::Locked));
    }

    #[test]
    fn test_session_validate_logout_and_permissions() {
        let db = test_db();
        let auth = AuthState::new();
        setup_pin(&db, None, Some("5678")).expect("setup");

        let session = login(&db, &auth, "5678").expect("login");
        assert!(validate_session(&auth, &session.session_id).is_some());
        assert!(has_permission(&auth, &session.session_id, "view_orders"));
        assert!(!has_permission(&auth, &session.session_id, "manage_staff"));
        assert!(!has_permission(&auth, "bogus-token", "view_orders"));

        logout(&auth, &session.session_id);
        assert!(validate_session(&auth, &session.session_id).is_none());
    }

    #[test]
    fn test_expired_session_is_evicted() {
        let db = test_db();
        let auth = AuthState::new();
        setup_pin(&db, Some("1234"), None).expect("setup");
        let session = login(&db, &auth, "1234").expect("login");

        // Force expiry
        {
            let mut sessions = auth.sessions.lock().unwrap();
            let entry = sessions.get_mut(&session.session_id).unwrap();
            entry.expires_at = Utc::now() - Duration::minutes(1);
        }

        assert!(validate_session(&auth, &session.session_id).is_none());
        // Evicted entirely, not just reported expired
        assert!(auth.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_login_audit_row_written() {
        let db = test_db();
        let auth = AuthState::new();
        setup_pin(&db, Some("1234"), None).expect("setup");
        let session = login(&db, &auth, "1234").expect("login");

        let conn = db.conn.lock().unwrap();
        let role: String = conn
            .query_row(
                "SELECT role FROM staff_sessions WHERE id = ?1",
                rusqlite::params![session.session_id],
                |row| row.get(0),
            )
            .expect("audit row");
        assert_eq!(role, "admin");
    }
}
