//! Migration runner configuration loaded from environment variables.
//!
//! Every setting has a default, so the runner can start with zero
//! configuration against the platform data directory.

use std::path::PathBuf;
use std::time::Duration;

use idstore_store::{CollectionNames, StoreConfig};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    /// SQLite database file.
    /// Env: `IDSTORE_DATABASE_PATH`
    /// Default: `None` (platform data directory, `idstore.db`).
    pub database_path: Option<PathBuf>,

    /// Env: `IDSTORE_HISTORY_COLLECTION`, `IDSTORE_ACCOUNTS_COLLECTION`,
    /// `IDSTORE_ROLES_COLLECTION`
    /// Default: `migration_history`, `accounts`, `roles`.
    pub collections: CollectionNames,

    /// How long to wait for another process holding the write lock.
    /// Env: `IDSTORE_BUSY_TIMEOUT_MS`
    /// Default: `5000`
    pub busy_timeout: Duration,

    /// Report the pending steps without applying them.
    /// Env: `IDSTORE_DRY_RUN` (true/false)
    /// Default: `false`
    pub dry_run: bool,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            database_path: None,
            collections: store.collections,
            busy_timeout: store.busy_timeout,
            dry_run: false,
        }
    }
}

impl MigrateConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var("IDSTORE_DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        // -- Collection names --

        if let Some(name) = var("IDSTORE_HISTORY_COLLECTION") {
            config.collections.history = name;
        }
        if let Some(name) = var("IDSTORE_ACCOUNTS_COLLECTION") {
            config.collections.accounts = name;
        }
        if let Some(name) = var("IDSTORE_ROLES_COLLECTION") {
            config.collections.roles = name;
        }

        if let Some(val) = var("IDSTORE_BUSY_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.busy_timeout = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid IDSTORE_BUSY_TIMEOUT_MS, using default"
                ),
            }
        }

        if let Some(val) = var("IDSTORE_DRY_RUN") {
            config.dry_run = val == "true" || val == "1";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            collections: self.collections.clone(),
            busy_timeout: self.busy_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> MigrateConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MigrateConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = load(&[]);
        assert_eq!(config.database_path, None);
        assert_eq!(config.collections.history, "migration_history");
        assert_eq!(config.busy_timeout, Duration::from_millis(5000));
        assert!(!config.dry_run);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("IDSTORE_DATABASE_PATH", "/var/lib/idstore/id.db"),
            ("IDSTORE_ACCOUNTS_COLLECTION", "users"),
            ("IDSTORE_BUSY_TIMEOUT_MS", "250"),
            ("IDSTORE_DRY_RUN", "true"),
        ]);
        assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/idstore/id.db")));
        assert_eq!(config.store_config().collections.accounts, "users");
        assert_eq!(config.store_config().busy_timeout, Duration::from_millis(250));
        assert!(config.dry_run);
    }

    #[test]
    fn test_invalid_timeout_keeps_default() {
        let config = load(&[("IDSTORE_BUSY_TIMEOUT_MS", "soon"), ("IDSTORE_DRY_RUN", "no")]);
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert!(!config.dry_run);
    }
}
