//! v003 -- Drop the legacy credential fields relocated by v001 and v002.
//!
//! A field is only removed once the token holding its data is present, so
//! documents v001/v002 refused to touch keep their data.

use super::{v001_authenticator_key, v002_recovery_codes, MigrationStep};
use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::field::FieldPath;
use crate::filter::Filter;
use crate::models::{
    TokenEntry, AUTHENTICATOR_KEY_TOKEN, INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN,
};
use crate::update::{matches_key, FieldUpdate};

pub const STEP: MigrationStep = MigrationStep::new(3, "drop_legacy_credential_fields", up);

fn up(accounts: &dyn DocumentCollection, _roles: &dyn DocumentCollection) -> Result<()> {
    let tokens = FieldPath::parse("tokens")?;
    let relocated = [
        (
            FieldPath::parse(v001_authenticator_key::LEGACY_FIELD)?,
            TokenEntry::key(INTERNAL_LOGIN_PROVIDER, AUTHENTICATOR_KEY_TOKEN),
        ),
        (
            FieldPath::parse(v002_recovery_codes::LEGACY_FIELD)?,
            TokenEntry::key(INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN),
        ),
    ];

    let cleaned = accounts.update_each(&Filter::Exists(tokens.clone()), &mut |doc| {
        let list = tokens
            .lookup(doc)
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        Ok(relocated
            .iter()
            .filter(|(legacy, key)| {
                legacy.lookup(doc).is_some() && list.iter().any(|token| matches_key(token, key))
            })
            .map(|(legacy, _)| FieldUpdate::unset(legacy.clone()))
            .collect())
    })?;

    tracing::info!(cleaned, "legacy credential fields removed");
    Ok(())
}
