//! v001 -- Relocate the top-level authenticator key into `tokens`.
//!
//! Early account documents kept the TOTP authenticator key in a dedicated
//! `authenticator_key` field.  The key now lives in the generic token list
//! under the store's internal login provider.  The legacy field is removed
//! later, by v003.

use serde_json::Value;

use super::MigrationStep;
use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::field::FieldPath;
use crate::filter::Filter;
use crate::models::{TokenEntry, AUTHENTICATOR_KEY_TOKEN, INTERNAL_LOGIN_PROVIDER};
use crate::update::FieldUpdate;

pub const STEP: MigrationStep = MigrationStep::new(1, "relocate_authenticator_key", up);

/// Legacy top-level field.
pub const LEGACY_FIELD: &str = "authenticator_key";

fn up(accounts: &dyn DocumentCollection, _roles: &dyn DocumentCollection) -> Result<()> {
    let legacy = FieldPath::parse(LEGACY_FIELD)?;
    let tokens = FieldPath::parse("tokens")?;

    // Accounts that already carry the token keep it: it may have been
    // rotated since the legacy field was last written.
    let filter = Filter::and([
        Filter::Exists(legacy.clone()),
        Filter::not(Filter::ElementMatch(
            tokens.clone(),
            TokenEntry::key(INTERNAL_LOGIN_PROVIDER, AUTHENTICATOR_KEY_TOKEN),
        )),
    ]);

    let moved = accounts.update_each(&filter, &mut |doc| {
        let Some(key) = legacy.lookup(doc).and_then(Value::as_str) else {
            tracing::warn!(id = ?doc.get("id"), "authenticator_key is not a string, left in place");
            return Ok(Vec::new());
        };
        let token = TokenEntry::internal(AUTHENTICATOR_KEY_TOKEN, key);
        Ok(vec![FieldUpdate::add_to_set(tokens.clone(), serde_json::to_value(token)?)])
    })?;

    tracing::info!(moved, "authenticator keys relocated into tokens");
    Ok(())
}
