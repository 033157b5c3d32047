//! Environment-driven service configuration.
//!
//! Loaded once at startup. Provider credentials (payment, email) are
//! optional: a missing email key downgrades notifications to a logged
//! warning, while a missing payment key fails card checkouts fast at
//! request time. Everything else has a sensible default.

use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

/// Runtime configuration for the ordering service.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the HTTP server binds on.
    pub port: u16,
    /// Directory holding the SQLite database and log files.
    pub data_dir: PathBuf,
    /// Public origin of the customer-facing site, used to build the
    /// payment success/cancel redirect URLs.
    pub public_origin: String,
    /// Payment provider secret key. `None` disables the card path.
    pub stripe_secret_key: Option<String>,
    /// Email provider API key. `None` disables notification dispatch.
    pub resend_api_key: Option<String>,
    /// Staff inbox for new-order alerts and contact-form relays.
    pub chef_email: String,
    /// Display name used in notification copy.
    pub restaurant_name: String,
    /// Pickup address included in confirmation emails.
    pub restaurant_address: String,
}

impl Config {
    pub fn load() -> Self {
        let config = Self {
            port: try_load("ORDERS_PORT", "8787"),
            data_dir: PathBuf::from(try_load::<String>("ORDERS_DATA_DIR", "./data")),
            public_origin: normalize_origin(&try_load::<String>(
                "PUBLIC_ORIGIN",
                "https://order.thesmall.app",
            )),
            stripe_secret_key: optional_secret("STRIPE_SECRET_KEY"),
            resend_api_key: optional_secret("RESEND_API_KEY"),
            chef_email: try_load("CHEF_EMAIL", "kitchen@thesmall.app"),
            restaurant_name: try_load("RESTAURANT_NAME", "The Small Kitchen"),
            restaurant_address: try_load("RESTAURANT_ADDRESS", "45 Cork St E, Guelph, ON N1H 2W7"),
        };

        if config.stripe_secret_key.is_none() {
            warn!("STRIPE_SECRET_KEY not set; card payments are disabled");
        }
        if config.resend_api_key.is_none() {
            warn!("RESEND_API_KEY not set; order notifications are disabled");
        }

        config
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| format!("invalid {key} value: {e}"))
        .expect("environment misconfigured")
}

/// Read an optional secret from the environment. Empty values count as
/// absent so a blank entry in a unit file does not half-enable a feature.
fn optional_secret(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Strip trailing slashes so URL joins stay predictable.
fn normalize_origin(origin: &str) -> String {
    let mut origin = origin.trim().to_string();
    while origin.ends_with('/') {
        origin.pop();
    }
    origin
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults_when_env_unset() {
        for key in [
            "ORDERS_PORT",
            "ORDERS_DATA_DIR",
            "PUBLIC_ORIGIN",
            "STRIPE_SECRET_KEY",
            "RESEND_API_KEY",
            "CHEF_EMAIL",
            "RESTAURANT_NAME",
            "RESTAURANT_ADDRESS",
        ] {
            env::remove_var(key);
        }

        let config = Config::load();
        assert_eq!(config.port, 8787);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.public_origin, "https://order.thesmall.app");
        assert!(config.stripe_secret_key.is_none());
        assert!(config.resend_api_key.is_none());
        assert_eq!(config.chef_email, "kitchen@thesmall.app");
    }

    #[test]
    #[serial]
    fn test_env_overrides_and_origin_normalization() {
        env::set_var("ORDERS_PORT", "9000");
        env::set_var("PUBLIC_ORIGIN", "https://example.test/");
        env::set_var("STRIPE_SECRET_KEY", "sk_test_abc");

        let config = Config::load();
        assert_eq!(config.port, 9000);
        assert_eq!(config.public_origin, "https://example.test");
        assert_eq!(config.stripe_secret_key.as_deref(), Some("sk_test_abc"));

        env::remove_var("ORDERS_PORT");
        env::remove_var("PUBLIC_ORIGIN");
        env::remove_var("STRIPE_SECRET_KEY");
    }

    #[test]
    #[serial]
    fn test_blank_secret_counts_as_absent() {
        env::set_var("RESEND_API_KEY", "   ");
        let config = Config::load();
        assert!(config.resend_api_key.is_none());
        env::remove_var("RESEND_API_KEY");
    }
}
