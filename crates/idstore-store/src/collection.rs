//! Document collections.
//!
//! [`DocumentCollection`] is the store capability the migration engine and
//! the field projection accessor are written against.  [`SqliteCollection`]
//! implements it on top of one SQLite table per collection, each row holding
//! a JSON document keyed by its opaque id.
//!
//! Field-level updates run inside a `BEGIN IMMEDIATE` transaction that reads
//! the one field, computes its new value and writes it back with
//! `json_set`/`json_remove`.  SQLite's write lock makes that sequence atomic
//! with respect to every other connection on the same file, and the rest of
//! the document is never rewritten.

use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior,
};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::field::{is_identifier, FieldPath};
use crate::filter::Filter;
use crate::update::{FieldChange, FieldUpdate};

/// Outcome of a single-document field update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    /// A document with the given id exists.
    pub matched: bool,
    /// The field was actually changed.
    pub modified: bool,
}

/// Closure deriving field updates for one document during a bulk update.
pub type DeriveUpdates<'a> = dyn FnMut(&Value) -> Result<Vec<FieldUpdate>> + 'a;

/// A collection of JSON documents keyed by opaque string ids.
pub trait DocumentCollection {
    fn name(&self) -> &str;

    /// Insert a document.  A missing or empty `id` is generated.
    fn insert_one(&self, document: Value) -> Result<String>;

    /// Insert several documents in one transaction.
    fn insert_many(&self, documents: Vec<Value>) -> Result<Vec<String>>;

    fn find_by_id(&self, id: &str) -> Result<Option<Value>>;

    fn find(&self, filter: &Filter) -> Result<Vec<Value>>;

    fn count(&self, filter: &Filter) -> Result<u64>;

    /// Fetch one field of one document.
    ///
    /// `None` means there is no such document; `Some(Value::Null)` means the
    /// document exists but the field is absent or `null`.
    fn project(&self, id: &str, path: &FieldPath) -> Result<Option<Value>>;

    /// Apply one field-level update atomically.
    fn update_one(&self, id: &str, update: &FieldUpdate) -> Result<UpdateOutcome>;

    /// Apply derived field updates to every document matching `filter`, as
    /// one atomic pass over the collection.  Returns the number of documents
    /// that changed.
    fn update_each(&self, filter: &Filter, derive: &mut DeriveUpdates<'_>) -> Result<u64>;

    /// Overwrite a whole document.  Returns `false` if it does not exist.
    fn replace_one(&self, id: &str, document: Value) -> Result<bool>;

    fn delete_one(&self, id: &str) -> Result<bool>;
}

/// A collection stored as a SQLite table of JSON bodies.
#[derive(Debug)]
pub struct SqliteCollection<'db> {
    conn: &'db Connection,
    name: String,
}

impl<'db> SqliteCollection<'db> {
    /// Bind to `name`, creating its table if needed.
    pub(crate) fn open(conn: &'db Connection, name: &str) -> Result<Self> {
        if !is_identifier(name) {
            return Err(StoreError::InvalidCollectionName(name.to_string()));
        }
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (
                id   TEXT PRIMARY KEY NOT NULL,   -- opaque document id
                body TEXT NOT NULL CHECK (json_valid(body))
            );"
        ))?;
        Ok(Self {
            conn,
            name: name.to_string(),
        })
    }

    fn table(&self) -> String {
        format!("\"{}\"", self.name)
    }

    fn insert_with(&self, conn: &Connection, document: Value) -> Result<String> {
        let Value::Object(mut map) = document else {
            return Err(StoreError::InvalidDocument(format!(
                "{} documents must be JSON objects",
                self.name
            )));
        };
        let id = match map.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = Uuid::new_v4().to_string();
                map.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let body = serde_json::to_string(&Value::Object(map))?;
        conn.execute(
            &format!("INSERT INTO {} (id, body) VALUES (?1, json(?2))", self.table()),
            params![id, body],
        )?;
        Ok(id)
    }

    fn select_bodies(&self, conn: &Connection, filter: &Filter) -> Result<Vec<(String, Value)>> {
        let mut params = Vec::new();
        let predicate = filter.to_sql("d.body", &mut params)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT d.id, d.body FROM {} AS d WHERE {predicate} ORDER BY d.rowid",
            self.table()
        ))?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, body) = row?;
            documents.push((id, serde_json::from_str(&body)?));
        }
        Ok(documents)
    }

    /// Read-compute-write of one field.  Callers hold the write lock.
    fn apply_update(
        &self,
        conn: &Connection,
        id: &str,
        update: &FieldUpdate,
    ) -> Result<UpdateOutcome> {
        if update.path.as_str() == "id" {
            return Err(StoreError::InvalidDocument(
                "the id field cannot be updated".to_string(),
            ));
        }
        let json_path = update.path.json_path();

        let current: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT body -> ?1 FROM {} WHERE id = ?2", self.table()),
                params![json_path, id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(UpdateOutcome::default());
        };
        let current = current
            .map(|text| serde_json::from_str::<Value>(&text))
            .transpose()?
            .filter(|v| !v.is_null());

        let affected = match update.evaluate(current.as_ref())? {
            FieldChange::Unchanged => 0,
            FieldChange::Write(value) => conn.execute(
                &format!(
                    "UPDATE {} SET body = json_set(body, ?1, json(?2)) WHERE id = ?3",
                    self.table()
                ),
                params![json_path, serde_json::to_string(&value)?, id],
            )?,
            FieldChange::Remove => conn.execute(
                &format!("UPDATE {} SET body = json_remove(body, ?1) WHERE id = ?2", self.table()),
                params![json_path, id],
            )?,
        };

        Ok(UpdateOutcome {
            matched: true,
            modified: affected > 0,
        })
    }
}

impl DocumentCollection for SqliteCollection<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert_one(&self, document: Value) -> Result<String> {
        self.insert_with(self.conn, document)
    }

    fn insert_many(&self, documents: Vec<Value>) -> Result<Vec<String>> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let ids = documents
            .into_iter()
            .map(|doc| self.insert_with(&tx, doc))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM {} WHERE id = ?1", self.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn find(&self, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self
            .select_bodies(self.conn, filter)?
            .into_iter()
            .map(|(_, body)| body)
            .collect())
    }

    fn count(&self, filter: &Filter) -> Result<u64> {
        let mut params: Vec<SqlValue> = Vec::new();
        let predicate = filter.to_sql("d.body", &mut params)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} AS d WHERE {predicate}", self.table()),
            params_from_iter(params),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn project(&self, id: &str, path: &FieldPath) -> Result<Option<Value>> {
        let field: Option<Option<String>> = self
            .conn
            .query_row(
                &format!("SELECT body -> ?1 FROM {} WHERE id = ?2", self.table()),
                params![path.json_path(), id],
                |row| row.get(0),
            )
            .optional()?;

        match field {
            None => Ok(None),
            Some(None) => Ok(Some(Value::Null)),
            Some(Some(text)) => Ok(Some(serde_json::from_str(&text)?)),
        }
    }

    fn update_one(&self, id: &str, update: &FieldUpdate) -> Result<UpdateOutcome> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let outcome = self.apply_update(&tx, id, update)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn update_each(&self, filter: &Filter, derive: &mut DeriveUpdates<'_>) -> Result<u64> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let documents = self.select_bodies(&tx, filter)?;

        let mut changed = 0u64;
        for (id, document) in &documents {
            let mut modified = false;
            for update in derive(document)? {
                modified |= self.apply_update(&tx, id, &update)?.modified;
            }
            if modified {
                changed += 1;
            }
        }
        tx.commit()?;

        tracing::debug!(
            collection = %self.name,
            matched = documents.len(),
            changed,
            "bulk update applied"
        );
        Ok(changed)
    }

    fn replace_one(&self, id: &str, document: Value) -> Result<bool> {
        let Value::Object(mut map) = document else {
            return Err(StoreError::InvalidDocument(format!(
                "{} documents must be JSON objects",
                self.name
            )));
        };
        map.insert("id".to_string(), Value::String(id.to_string()));
        let affected = self.conn.execute(
            &format!("UPDATE {} SET body = json(?1) WHERE id = ?2", self.table()),
            params![serde_json::to_string(&Value::Object(map))?, id],
        )?;
        Ok(affected > 0)
    }

    fn delete_one(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", self.table()), params![id])?;
        Ok(affected > 0)
    }
}
