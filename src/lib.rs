//! The Small Orders - Online ordering backend
//!
//! One service owns the order lifecycle for a single restaurant: menu
//! browsing, pay-at-pickup and hosted-card checkout, idempotent payment
//! verification, notification dispatch, and the staff dashboard's order
//! alerts, pickup gate, and menu availability. Clients receive push
//! updates over the `/api/events` SSE stream.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod alerts;
pub mod auth;
pub mod checkout;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gate;
pub mod http;
pub mod menu;
pub mod notify;
pub mod orders;
pub mod pricing;
pub mod stripe;
pub mod timezone;
pub mod verify;

use crate::alerts::AlertEngine;
use crate::auth::AuthState;
use crate::config::Config;
use crate::events::EventBus;
use crate::http::AppState;
use crate::notify::Mailer;
use crate::stripe::{PaymentProvider, StripeClient};

/// Daily log files older than this are removed at startup.
const LOG_RETENTION_DAYS: u64 = 14;

/// App entry point: logging, config, database, background engine, server.
pub async fn run() -> anyhow::Result<()> {
    // Initialize structured logging (console + rolling file). The log
    // directory must be known before Config::load so its messages land in
    // the subscriber; read the same variable Config uses.
    let log_dir = PathBuf::from(
        env::var("ORDERS_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
    )
    .join("logs");
    fs::create_dir_all(&log_dir).ok();
    prune_old_logs(&log_dir);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_orders=debug"));

    let file_appender = tracing_appender::rolling::daily(&log_dir, "orders");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the app — dropping it flushes
    // logs. We leak it intentionally since the app runs until process exit.
    std::mem::forget(_guard);

    info!("Starting The Small Orders v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load());
    let db = Arc::new(db::init(&config.data_dir).map_err(anyhow::Error::msg)?);

    let bus = EventBus::new();
    let mailer = Arc::new(Mailer::from_config(&config));
    let provider: Option<Arc<dyn PaymentProvider>> = match config.stripe_secret_key.as_deref() {
        Some(key) => Some(Arc::new(StripeClient::new(key).map_err(anyhow::Error::msg)?)),
        None => None,
    };
    let auth = Arc::new(AuthState::new());

    // Alert engine watches the bus for order inserts
    let alerts = AlertEngine::new(Arc::clone(&db), bus.clone());
    alerts.start();

    let state = AppState {
        db,
        config: Arc::clone(&config),
        bus,
        mailer,
        provider,
        auth,
        alerts: Arc::clone(&alerts),
    };

    let app = http::router(state);
    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    alerts.shutdown();
    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Remove daily log files past the retention window.
fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };
    let cutoff = SystemTime::now() - Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if let Ok(modified) = metadata.modified() {
            if modified < cutoff {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
