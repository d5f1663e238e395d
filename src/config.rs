//! Runtime configuration, read from the environment.

use std::path::PathBuf;

pub const DEFAULT_ADDR: &str = "0.0.0.0:3002";
pub const DEFAULT_DB_PATH: &str = "data/relay.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listen address (`RELAY_ADDR`).
    pub addr: String,
    /// SQLite database file (`RELAY_DB_PATH`).
    pub db_path: PathBuf,
    /// Allowed browser origin (`RELAY_CORS_ORIGIN`). Any origin when unset.
    pub cors_origin: Option<String>,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            addr: get("RELAY_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            db_path: get("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            cors_origin: get("RELAY_CORS_ORIGIN"),
        }
    }
}
