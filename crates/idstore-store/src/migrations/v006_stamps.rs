//! v006 -- Backfill security and concurrency stamps.

use serde_json::Value;
use uuid::Uuid;

use super::MigrationStep;
use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::field::FieldPath;
use crate::filter::Filter;
use crate::update::FieldUpdate;

pub const STEP: MigrationStep = MigrationStep::new(6, "backfill_stamps", up);

fn up(accounts: &dyn DocumentCollection, roles: &dyn DocumentCollection) -> Result<()> {
    let accounts_changed = stamp(accounts, &["security_stamp", "concurrency_stamp"])?;
    let roles_changed = stamp(roles, &["concurrency_stamp"])?;

    tracing::info!(accounts_changed, roles_changed, "stamps backfilled");
    Ok(())
}

fn stamp(collection: &dyn DocumentCollection, fields: &[&str]) -> Result<u64> {
    let fields = fields
        .iter()
        .map(|f| FieldPath::parse(f))
        .collect::<Result<Vec<_>>>()?;

    collection.update_each(&Filter::All, &mut |doc| {
        Ok(fields
            .iter()
            .filter(|f| f.lookup(doc).map_or(true, Value::is_null))
            .map(|f| FieldUpdate::set(f.clone(), Value::String(Uuid::new_v4().to_string())))
            .collect())
    })
}
