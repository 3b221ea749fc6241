use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A document or field value could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A field selector is not a valid dotted path.
    #[error("Invalid field path: {0:?}")]
    InvalidFieldPath(String),

    /// A filter cannot be expressed against the store.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// A collection name is not a plain identifier.
    #[error("Invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    /// A stored or submitted document does not have the expected shape.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// A role referenced by normalized name does not exist.
    #[error("Role not found: {0}")]
    RoleNotFound(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced while discovering or applying schema migrations.
///
/// All variants are fatal: the host must not serve record-access traffic
/// after any of them.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Two registered steps declare the same version.
    #[error("Migration version {version} declared by both {first} and {second}")]
    DuplicateVersion {
        version: u32,
        first: &'static str,
        second: &'static str,
    },

    /// A step body failed; remaining steps were not attempted.
    #[error("Migration v{version:03} ({name}) failed: {source}")]
    Failed {
        version: u32,
        name: &'static str,
        #[source]
        source: StoreError,
    },

    /// Reading or writing the history collection failed.
    #[error("Migration history error: {0}")]
    History(#[source] StoreError),
}
