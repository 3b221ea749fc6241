//! Field projection accessor.
//!
//! [`FieldProjectionAccessor`] is how the record-access layer reads and
//! mutates records that independent processes may be touching at the same
//! time.  It never holds a cache: every read is a fresh single-field query,
//! and every write is a single-field update (or an atomic set-style list
//! operation) that leaves the other fields of the document alone.  Two
//! writers updating different fields of the same record therefore both
//! persist; two writers updating the same field resolve last-write-wins.
//!
//! Whole-document writes are deliberately kept off this type.  They live on
//! [`WholeDocument`], obtained through
//! [`FieldProjectionAccessor::whole_document`], so a caller has to opt into
//! the weaker read-modify-write consistency explicitly.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::collection::{DocumentCollection, UpdateOutcome};
use crate::error::Result;
use crate::field::Field;
use crate::filter::Filter;
use crate::models::Record;
use crate::update::{ElementKey, FieldUpdate};

/// Field-level read/update access to the records of one collection.
pub struct FieldProjectionAccessor<'c, R> {
    collection: &'c dyn DocumentCollection,
    _record: PhantomData<fn() -> R>,
}

impl<'c, R: Record> FieldProjectionAccessor<'c, R> {
    pub fn new(collection: &'c dyn DocumentCollection) -> Self {
        Self {
            collection,
            _record: PhantomData,
        }
    }

    pub fn collection(&self) -> &'c dyn DocumentCollection {
        self.collection
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current persisted value of one field.
    ///
    /// `None` when the record no longer exists or the field is absent.
    pub fn read_field<T: DeserializeOwned>(
        &self,
        id: &str,
        field: Field<R, T>,
    ) -> Result<Option<T>> {
        match self.collection.project(id, &field.path()?)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// Persisted value, falling back to the caller's in-memory value when
    /// the store has nothing.
    pub fn read_or<T: DeserializeOwned>(
        &self,
        id: &str,
        field: Field<R, T>,
        in_memory: T,
    ) -> Result<T> {
        Ok(self.read_field(id, field)?.unwrap_or(in_memory))
    }

    /// Like [`read_or`](Self::read_or) for optional fields.
    pub fn read_optional<T: DeserializeOwned + Clone>(
        &self,
        id: &str,
        field: Field<R, T>,
        in_memory: &Option<T>,
    ) -> Result<Option<T>> {
        Ok(self.read_field(id, field)?.or_else(|| in_memory.clone()))
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<R>> {
        self.collection
            .find_by_id(id)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub fn find_one(&self, filter: &Filter) -> Result<Option<R>> {
        Ok(self.find(filter)?.into_iter().next())
    }

    pub fn find(&self, filter: &Filter) -> Result<Vec<R>> {
        self.collection
            .find(filter)?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .collect()
    }

    // ------------------------------------------------------------------
    // Single-field writes
    // ------------------------------------------------------------------

    /// Overwrite one field; other fields are untouched.
    pub fn set_field<T: Serialize>(
        &self,
        id: &str,
        field: Field<R, T>,
        value: &T,
    ) -> Result<UpdateOutcome> {
        self.update(id, FieldUpdate::set(field.path()?, serde_json::to_value(value)?))
    }

    pub fn unset_field<T>(&self, id: &str, field: Field<R, T>) -> Result<UpdateOutcome> {
        self.update(id, FieldUpdate::unset(field.path()?))
    }

    /// Set when `Some`, unset when `None`.
    pub fn set_optional<T: Serialize>(
        &self,
        id: &str,
        field: Field<R, T>,
        value: Option<&T>,
    ) -> Result<UpdateOutcome> {
        match value {
            Some(v) => self.set_field(id, field, v),
            None => self.unset_field(id, field),
        }
    }

    /// Atomically add to an integer field and return the persisted result.
    ///
    /// A result that would not fit in an `i32` is an error and the stored
    /// value is left as it was.
    pub fn increment(&self, id: &str, field: Field<R, i32>, by: i32) -> Result<Option<i32>> {
        let update = FieldUpdate::increment_within(
            field.path()?,
            i64::from(by),
            i64::from(i32::MIN)..=i64::from(i32::MAX),
        );
        let outcome = self.update(id, update)?;
        if !outcome.matched {
            return Ok(None);
        }
        self.read_field(id, field)
    }

    // ------------------------------------------------------------------
    // Set-style list writes
    // ------------------------------------------------------------------

    /// Append `element` unless a structurally equal one is already present.
    pub fn add_to_set<E: Serialize>(
        &self,
        id: &str,
        field: Field<R, Vec<E>>,
        element: &E,
    ) -> Result<UpdateOutcome> {
        self.update(id, FieldUpdate::add_to_set(field.path()?, serde_json::to_value(element)?))
    }

    /// Remove every element structurally equal to `element`.
    pub fn remove_from_set<E: Serialize>(
        &self,
        id: &str,
        field: Field<R, Vec<E>>,
        element: &E,
    ) -> Result<UpdateOutcome> {
        self.update(id, FieldUpdate::pull(field.path()?, serde_json::to_value(element)?))
    }

    /// Remove every element whose sub-fields match `key`.
    pub fn remove_matching<E>(
        &self,
        id: &str,
        field: Field<R, Vec<E>>,
        key: ElementKey,
    ) -> Result<UpdateOutcome> {
        self.update(id, FieldUpdate::pull_where(field.path()?, key))
    }

    /// Replace the element matching `key`, or append `element`.
    pub fn upsert_element<E: Serialize>(
        &self,
        id: &str,
        field: Field<R, Vec<E>>,
        key: ElementKey,
        element: &E,
    ) -> Result<UpdateOutcome> {
        self.update(
            id,
            FieldUpdate::upsert(field.path()?, key, serde_json::to_value(element)?),
        )
    }

    pub fn replace_element<E: Serialize>(
        &self,
        id: &str,
        field: Field<R, Vec<E>>,
        old: &E,
        new: &E,
    ) -> Result<UpdateOutcome> {
        self.update(
            id,
            FieldUpdate::replace_element(
                field.path()?,
                serde_json::to_value(old)?,
                serde_json::to_value(new)?,
            ),
        )
    }

    fn update(&self, id: &str, update: FieldUpdate) -> Result<UpdateOutcome> {
        let outcome = self.collection.update_one(id, &update)?;
        tracing::trace!(
            collection = self.collection.name(),
            id,
            field = %update.path,
            matched = outcome.matched,
            modified = outcome.modified,
            "field update"
        );
        Ok(outcome)
    }

    /// Opt into whole-document writes.
    pub fn whole_document(&self) -> WholeDocument<'c, R> {
        WholeDocument {
            collection: self.collection,
            _record: PhantomData,
        }
    }
}

/// Whole-document writes.  A replace overwrites fields other processes may
/// have changed since the caller loaded the record.
pub struct WholeDocument<'c, R> {
    collection: &'c dyn DocumentCollection,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> WholeDocument<'_, R> {
    pub fn insert(&self, record: &R) -> Result<String> {
        self.collection.insert_one(serde_json::to_value(record)?)
    }

    pub fn replace(&self, record: &R) -> Result<bool> {
        self.collection
            .replace_one(record.id(), serde_json::to_value(record)?)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        self.collection.delete_one(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, StoreConfig};
    use crate::models::{AccountRecord, Claim, LoginBinding};
    use crate::update::element_key;
    use serde_json::json;

    fn seed(db: &Database) -> AccountRecord {
        let accounts = db.accounts().unwrap();
        let account = AccountRecord {
            email: Some("ada@example.com".into()),
            ..AccountRecord::new("ada")
        };
        FieldProjectionAccessor::<AccountRecord>::new(&accounts)
            .whole_document()
            .insert(&account)
            .unwrap();
        account
    }

    #[test]
    fn read_prefers_persisted_value_over_in_memory_copy() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let accessor = FieldProjectionAccessor::<AccountRecord>::new(&accounts);
        let stale = seed(&db);

        accessor
            .set_field(&stale.id, AccountRecord::EMAIL, &"new@example.com".to_string())
            .unwrap();

        let email = accessor
            .read_optional(&stale.id, AccountRecord::EMAIL, &stale.email)
            .unwrap();
        assert_eq!(email.as_deref(), Some("new@example.com"));

        // Nothing persisted: fall back to memory.
        let phone = accessor
            .read_optional(&stale.id, AccountRecord::PHONE_NUMBER, &Some("555".to_string()))
            .unwrap();
        assert_eq!(phone.as_deref(), Some("555"));
    }

    #[test]
    fn read_of_deleted_record_is_none_not_error() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let accessor = FieldProjectionAccessor::<AccountRecord>::new(&accounts);
        let account = seed(&db);

        assert!(accessor.whole_document().delete(&account.id).unwrap());
        assert_eq!(accessor.read_field(&account.id, AccountRecord::EMAIL).unwrap(), None);
        assert!(accessor.find_by_id(&account.id).unwrap().is_none());
        assert!(!accessor
            .set_field(&account.id, AccountRecord::EMAIL, &"x".to_string())
            .unwrap()
            .matched);
    }

    #[test]
    fn concurrent_writers_to_different_fields_both_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let first = Database::open_at(&path, StoreConfig::default()).unwrap();
        let second = Database::open_at(&path, StoreConfig::default()).unwrap();
        let account = seed(&first);

        let accounts_a = first.accounts().unwrap();
        let accounts_b = second.accounts().unwrap();
        let a = FieldProjectionAccessor::<AccountRecord>::new(&accounts_a);
        let b = FieldProjectionAccessor::<AccountRecord>::new(&accounts_b);

        // Both writers started from the same stale copy.
        a.set_field(&account.id, AccountRecord::PHONE_NUMBER, &"555-0100".to_string())
            .unwrap();
        b.set_field(&account.id, AccountRecord::EMAIL_CONFIRMED, &true).unwrap();

        let merged = a.find_by_id(&account.id).unwrap().unwrap();
        assert_eq!(merged.phone_number.as_deref(), Some("555-0100"));
        assert!(merged.email_confirmed);
        assert_eq!(merged.email, account.email);
    }

    #[test]
    fn concurrent_threads_appending_different_elements_both_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads.db");
        let account = seed(&Database::open_at(&path, StoreConfig::default()).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                let id = account.id.clone();
                std::thread::spawn(move || {
                    let db = Database::open_at(&path, StoreConfig::default()).unwrap();
                    let accounts = db.accounts().unwrap();
                    let accessor = FieldProjectionAccessor::<AccountRecord>::new(&accounts);
                    for n in 0..5 {
                        accessor
                            .add_to_set(
                                &id,
                                AccountRecord::CLAIMS,
                                &Claim::new("t", format!("{i}-{n}")),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let db = Database::open_at(&path, StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let claims = FieldProjectionAccessor::<AccountRecord>::new(&accounts)
            .read_field(&account.id, AccountRecord::CLAIMS)
            .unwrap()
            .unwrap();
        assert_eq!(claims.len(), 20);
    }

    #[test]
    fn add_to_set_twice_keeps_one_occurrence() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let accessor = FieldProjectionAccessor::<AccountRecord>::new(&accounts);
        let account = seed(&db);
        let login = LoginBinding {
            login_provider: "github".into(),
            provider_key: "42".into(),
            display_name: Some("GitHub".into()),
        };

        assert!(accessor.add_to_set(&account.id, AccountRecord::LOGINS, &login).unwrap().modified);
        assert!(!accessor.add_to_set(&account.id, AccountRecord::LOGINS, &login).unwrap().modified);

        let logins = accessor.read_field(&account.id, AccountRecord::LOGINS).unwrap().unwrap();
        assert_eq!(logins, vec![login.clone()]);

        accessor
            .remove_matching(
                &account.id,
                AccountRecord::LOGINS,
                element_key([("login_provider", json!("github")), ("provider_key", json!("42"))]),
            )
            .unwrap();
        assert_eq!(
            accessor.read_field(&account.id, AccountRecord::LOGINS).unwrap(),
            Some(vec![])
        );
    }

    #[test]
    fn increment_returns_new_value() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let accessor = FieldProjectionAccessor::<AccountRecord>::new(&accounts);
        let account = seed(&db);

        let field = AccountRecord::ACCESS_FAILED_COUNT;

        assert_eq!(accessor.increment(&account.id, field, 1).unwrap(), Some(1));
        assert_eq!(accessor.increment(&account.id, field, 2).unwrap(), Some(3));
        assert_eq!(accessor.increment("missing", field, 1).unwrap(), None);
    }

    #[test]
    fn increment_that_would_overflow_leaves_field_alone() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let accessor = FieldProjectionAccessor::<AccountRecord>::new(&accounts);
        let account = seed(&db);
        let field = AccountRecord::ACCESS_FAILED_COUNT;

        accessor.set_field(&account.id, field, &(i32::MAX - 1)).unwrap();
        assert_eq!(accessor.increment(&account.id, field, 1).unwrap(), Some(i32::MAX));
        assert!(accessor.increment(&account.id, field, 1).is_err());
        assert_eq!(accessor.read_field(&account.id, field).unwrap(), Some(i32::MAX));
    }

    #[test]
    fn malformed_selector_is_an_error() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        let accounts = db.accounts().unwrap();
        let accessor = FieldProjectionAccessor::<AccountRecord>::new(&accounts);
        let bogus: Field<AccountRecord, String> = Field::new("email; --");
        assert!(accessor.read_field("any", bogus).is_err());
    }
}
