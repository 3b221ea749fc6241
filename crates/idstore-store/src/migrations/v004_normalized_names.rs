//! v004 -- Backfill normalized lookup keys.
//!
//! Lookups by user name, email and role name go through upper-cased
//! `normalized_*` fields.  Documents created before those fields existed get
//! them derived from the display values.

use serde_json::Value;

use super::MigrationStep;
use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::field::FieldPath;
use crate::filter::Filter;
use crate::update::FieldUpdate;

pub const STEP: MigrationStep = MigrationStep::new(4, "backfill_normalized_names", up);

/// The normalization applied to lookup keys.
pub fn normalize(value: &str) -> String {
    value.to_uppercase()
}

fn up(accounts: &dyn DocumentCollection, roles: &dyn DocumentCollection) -> Result<()> {
    let accounts_changed = backfill(
        accounts,
        &[("user_name", "normalized_user_name"), ("email", "normalized_email")],
    )?;
    let roles_changed = backfill(roles, &[("name", "normalized_name")])?;

    tracing::info!(accounts_changed, roles_changed, "normalized names backfilled");
    Ok(())
}

/// For each `(source, target)` pair, set `target` from `source` where the
/// target is missing.
fn backfill(collection: &dyn DocumentCollection, pairs: &[(&str, &str)]) -> Result<u64> {
    let pairs = pairs
        .iter()
        .map(|(source, target)| Ok((FieldPath::parse(source)?, FieldPath::parse(target)?)))
        .collect::<Result<Vec<_>>>()?;

    collection.update_each(&Filter::All, &mut |doc| {
        Ok(pairs
            .iter()
            .filter(|(_, target)| target.lookup(doc).map_or(true, Value::is_null))
            .filter_map(|(source, target)| {
                let source = source.lookup(doc).and_then(Value::as_str)?;
                Some(FieldUpdate::set(target.clone(), Value::String(normalize(source))))
            })
            .collect())
    })
}
