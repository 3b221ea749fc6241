//! # idstore-migrate
//!
//! Brings an idstore database up to the latest schema version.
//!
//! Hosts run this before starting anything that serves account or role
//! traffic.  With `IDSTORE_DRY_RUN=true` it only reports which steps are
//! pending.

mod config;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use idstore_store::{Database, MigrationEngine, MigrationRegistry};

use crate::config::MigrateConfig;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,idstore_store=debug,idstore_migrate=debug")
            }),
        )
        .init();

    info!("Starting idstore-migrate v{}", env!("CARGO_PKG_VERSION"));

    let config = MigrateConfig::from_env();
    info!(?config, "Loaded configuration");

    let db = match &config.database_path {
        Some(path) => Database::open_at(path, config.store_config()),
        None => Database::new(config.store_config()),
    }
    .context("failed to open database")?;

    let registry = MigrationRegistry::discover().context("invalid migration registry")?;

    if config.dry_run {
        let history = db.history().context("failed to open history collection")?;
        let plan = MigrationEngine::new(&registry)
            .plan(&history)
            .context("failed to read migration history")?;
        if plan.is_up_to_date() {
            info!(version = plan.current_version, "Schema is up to date");
        } else {
            info!(
                version = plan.current_version,
                pending = ?plan.pending,
                "Dry run: steps would be applied"
            );
        }
        return Ok(());
    }

    let applied = db.migrate(&registry).context("schema migration failed")?;
    info!(
        applied = applied.len(),
        version = applied.last().map(|r| r.database_version),
        "Done"
    );

    Ok(())
}
