//! Configuration objects injected at construction.

use std::time::Duration;

/// Connection settings for [`crate::store::SqlStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// `postgres://...` or `sqlite:...` URL.
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Read `KEYSTONE_DATABASE_URL`, `KEYSTONE_DB_MAX_CONNECTIONS` and
    /// `KEYSTONE_DB_ACQUIRE_TIMEOUT_SECS`, keeping defaults for anything unset
    /// or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("KEYSTONE_DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: std::env::var("KEYSTONE_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: std::env::var("KEYSTONE_DB_ACQUIRE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// In-memory SQLite databases live and die with their connection.
    pub fn is_in_memory_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:") && self.database_url.contains(":memory:")
    }
}
