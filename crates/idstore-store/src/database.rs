//! Connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`], creates the
//! configured collection tables and hands out [`SqliteCollection`] handles.
//! It also runs the schema migration engine; hosts must call
//! [`Database::migrate`] before serving any record-access traffic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::collection::SqliteCollection;
use crate::error::{MigrationError, Result, StoreError};
use crate::migrations::{MigrationEngine, MigrationRegistry};
use crate::models::HistoryRecord;

/// Names of the three collections the store works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub history: String,
    pub accounts: String,
    pub roles: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            history: "migration_history".to_string(),
            accounts: "accounts".to_string(),
            roles: "roles".to_string(),
        }
    }
}

/// Store settings supplied by the host.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub collections: CollectionNames,
    /// How long a connection waits for another process's write lock.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collections: CollectionNames::default(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    config: StoreConfig,
}

impl Database {
    /// Open (or create) the default database in the platform data directory:
    /// - Linux:   `~/.local/share/idstore/idstore.db`
    /// - macOS:   `~/Library/Application Support/com.idstore.idstore/idstore.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\idstore\idstore\data\idstore.db`
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::open_at(&Self::default_path()?, config)
    }

    /// Default database location, creating its directory.
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "idstore", "idstore").ok_or(StoreError::NoDataDir)?;
        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        Ok(data_dir.join("idstore.db"))
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// Several processes may open the same file; field-level updates stay
    /// atomic across them.
    pub fn open_at(path: &Path, config: StoreConfig) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, config)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(config: StoreConfig) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, config)
    }

    fn init(conn: Connection, config: StoreConfig) -> Result<Self> {
        let names = &config.collections;
        for name in [&names.history, &names.accounts, &names.roles] {
            SqliteCollection::open(&conn, name)?;
        }

        Ok(Self { conn, config })
    }

    /// Handle on an arbitrary collection, created if missing.
    pub fn collection(&self, name: &str) -> Result<SqliteCollection<'_>> {
        SqliteCollection::open(&self.conn, name)
    }

    pub fn history(&self) -> Result<SqliteCollection<'_>> {
        self.collection(&self.config.collections.history)
    }

    pub fn accounts(&self) -> Result<SqliteCollection<'_>> {
        self.collection(&self.config.collections.accounts)
    }

    pub fn roles(&self) -> Result<SqliteCollection<'_>> {
        self.collection(&self.config.collections.roles)
    }

    /// Bring the accounts and roles collections up to the registry's latest
    /// schema version.  Returns the history records written by this run.
    pub fn migrate(
        &self,
        registry: &MigrationRegistry,
    ) -> std::result::Result<Vec<HistoryRecord>, MigrationError> {
        let history = self.history().map_err(MigrationError::History)?;
        let accounts = self.accounts().map_err(MigrationError::History)?;
        let roles = self.roles().map_err(MigrationError::History)?;

        MigrationEngine::new(registry).apply(&history, &accounts, &roles)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
