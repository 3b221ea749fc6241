//! v005 -- Store role membership by role id.
//!
//! Older accounts list the *names* of their roles.  Membership is now kept
//! as role ids so that renaming a role does not orphan its members.  Entries
//! that are already ids, or that match no role, are left as they are.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::MigrationStep;
use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::field::FieldPath;
use crate::filter::Filter;
use crate::models::RoleRecord;
use crate::update::FieldUpdate;

pub const STEP: MigrationStep = MigrationStep::new(5, "role_names_to_ids", up);

fn up(accounts: &dyn DocumentCollection, roles: &dyn DocumentCollection) -> Result<()> {
    let known: Vec<RoleRecord> = roles
        .find(&Filter::All)?
        .into_iter()
        .map(serde_json::from_value)
        .collect::<std::result::Result<_, _>>()?;

    let ids: HashSet<&str> = known.iter().map(|r| r.id.as_str()).collect();
    let mut by_name: HashMap<&str, &str> = HashMap::new();
    for role in &known {
        for name in [role.name.as_deref(), role.normalized_name.as_deref()].into_iter().flatten() {
            by_name.entry(name).or_insert(role.id.as_str());
        }
    }

    let roles_path = FieldPath::parse("roles")?;
    let rewritten = accounts.update_each(&Filter::Exists(roles_path.clone()), &mut |doc| {
        let Some(entries) = roles_path.lookup(doc).and_then(Value::as_array) else {
            return Ok(Vec::new());
        };

        let mut resolved: Vec<Value> = Vec::with_capacity(entries.len());
        for entry in entries {
            let mapped = match entry.as_str() {
                Some(id) if ids.contains(id) => entry.clone(),
                Some(name) => match by_name.get(name) {
                    Some(id) => Value::String((*id).to_string()),
                    None => {
                        tracing::warn!(
                            id = ?doc.get("id"),
                            role = name,
                            "account references unknown role"
                        );
                        entry.clone()
                    }
                },
                None => entry.clone(),
            };
            if !resolved.contains(&mapped) {
                resolved.push(mapped);
            }
        }

        if resolved == *entries {
            Ok(Vec::new())
        } else {
            Ok(vec![FieldUpdate::set(roles_path.clone(), Value::Array(resolved))])
        }
    })?;

    tracing::info!(rewritten, "role memberships converted to ids");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, StoreConfig};
    use serde_json::json;

    #[test]
    fn resolves_names_and_keeps_ids_and_unknowns() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let roles = db.roles().unwrap();
        roles
            .insert_many(vec![
                json!({ "id": "r-admin", "name": "Admin", "normalized_name": "ADMIN" }),
                json!({ "id": "r-user", "name": "User" }),
            ])
            .unwrap();
        accounts
            .insert_many(vec![
                json!({ "id": "a", "roles": ["Admin", "r-user", "ghost"] }),
                json!({ "id": "b", "roles": ["ADMIN", "Admin"] }),
                json!({ "id": "c", "roles": ["r-admin"] }),
            ])
            .unwrap();

        STEP.apply(&accounts, &roles).unwrap();
        let after_first = accounts.find(&Filter::All).unwrap();
        STEP.apply(&accounts, &roles).unwrap();

        assert_eq!(accounts.find(&Filter::All).unwrap(), after_first);
        assert_eq!(
            accounts.find_by_id("a").unwrap().unwrap()["roles"],
            json!(["r-admin", "r-user", "ghost"])
        );
        assert_eq!(accounts.find_by_id("b").unwrap().unwrap()["roles"], json!(["r-admin"]));
        assert_eq!(accounts.find_by_id("c").unwrap().unwrap()["roles"], json!(["r-admin"]));
    }
}
