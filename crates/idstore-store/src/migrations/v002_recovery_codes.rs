//! v002 -- Relocate second-factor recovery codes into `tokens`.
//!
//! The legacy `recovery_codes` array becomes a single `RecoveryCodes` token
//! whose value is the codes joined with `;`.

use serde_json::Value;

use super::MigrationStep;
use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::field::FieldPath;
use crate::filter::Filter;
use crate::models::{TokenEntry, INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN};
use crate::update::FieldUpdate;

pub const STEP: MigrationStep = MigrationStep::new(2, "relocate_recovery_codes", up);

pub const LEGACY_FIELD: &str = "recovery_codes";

fn up(accounts: &dyn DocumentCollection, _roles: &dyn DocumentCollection) -> Result<()> {
    let legacy = FieldPath::parse(LEGACY_FIELD)?;
    let tokens = FieldPath::parse("tokens")?;

    let filter = Filter::and([
        Filter::Exists(legacy.clone()),
        Filter::not(Filter::ElementMatch(
            tokens.clone(),
            TokenEntry::key(INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN),
        )),
    ]);

    let moved = accounts.update_each(&filter, &mut |doc| {
        let codes: Option<Vec<&str>> = legacy
            .lookup(doc)
            .and_then(Value::as_array)
            .and_then(|items| items.iter().map(Value::as_str).collect());
        let Some(codes) = codes else {
            tracing::warn!(
                id = ?doc.get("id"),
                "recovery_codes is not a list of strings, left in place"
            );
            return Ok(Vec::new());
        };
        let token = TokenEntry::internal(RECOVERY_CODES_TOKEN, codes.join(";"));
        Ok(vec![FieldUpdate::add_to_set(tokens.clone(), serde_json::to_value(token)?)])
    })?;

    tracing::info!(moved, "recovery codes relocated into tokens");
    Ok(())
}
