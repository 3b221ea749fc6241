//! # idstore-store
//!
//! Document storage for identity accounts and roles, backed by SQLite.
//!
//! Each collection is a table of JSON documents.  On top of it the crate
//! provides:
//! - a field projection accessor that reads and updates one field at a time,
//!   so independent processes sharing the database do not overwrite each
//!   other's changes to unrelated fields
//! - record stores for accounts and roles built on that accessor
//! - a versioned migration engine that upgrades the stored documents and
//!   records what it applied in a history collection

pub mod accessor;
pub mod accounts;
pub mod collection;
pub mod database;
pub mod field;
pub mod filter;
pub mod migrations;
pub mod models;
pub mod roles;
pub mod update;

mod error;

pub use accessor::{FieldProjectionAccessor, WholeDocument};
pub use accounts::AccountStore;
pub use collection::{DocumentCollection, SqliteCollection, UpdateOutcome};
pub use database::{CollectionNames, Database, StoreConfig};
pub use error::{MigrationError, StoreError};
pub use field::{Field, FieldPath};
pub use filter::Filter;
pub use migrations::{MigrationEngine, MigrationPlan, MigrationRegistry, MigrationStep};
pub use models::*;
pub use roles::RoleStore;
pub use update::{FieldUpdate, UpdateOp};
