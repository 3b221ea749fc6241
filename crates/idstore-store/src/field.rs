//! Field selectors.
//!
//! A [`FieldPath`] names one field of a stored document using a dotted path
//! (`tokens`, `lockout.end`).  A [`Field`] is the typed form used by the
//! record-access layer: it ties a path to the record type it belongs to and
//! to the Rust type of the value stored there, so that reading
//! `AccountRecord::EMAIL` yields an `Option<String>` without any stringly
//! typed plumbing at the call site.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{Result, StoreError};

/// A validated dotted field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    dotted: String,
}

impl FieldPath {
    /// Parse a dotted path.  Every segment must be a plain identifier.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() || !path.split('.').all(is_identifier) {
            return Err(StoreError::InvalidFieldPath(path.to_string()));
        }
        Ok(Self {
            dotted: path.to_string(),
        })
    }

    /// The path as written, e.g. `normalized_email`.
    pub fn as_str(&self) -> &str {
        &self.dotted
    }

    /// The path in SQLite JSON syntax, e.g. `$.normalized_email`.
    pub fn json_path(&self) -> String {
        format!("$.{}", self.dotted)
    }

    /// Look the field up inside an already-loaded document.
    pub fn lookup<'v>(&self, document: &'v serde_json::Value) -> Option<&'v serde_json::Value> {
        self.dotted
            .split('.')
            .try_fold(document, |value, segment| value.get(segment))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted)
    }
}

pub(crate) fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A typed projection of one field of record type `R` holding a `T`.
///
/// Declared as associated constants on the record types; the path is
/// validated when the selector is used.
pub struct Field<R, T> {
    path: &'static str,
    _marker: PhantomData<fn(&R) -> T>,
}

impl<R, T> Field<R, T> {
    pub const fn new(path: &'static str) -> Self {
        Self {
            path,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.path
    }

    pub fn path(&self) -> Result<FieldPath> {
        FieldPath::parse(self.path)
    }
}

// Manual impls: deriving would put bounds on `R` and `T`.
impl<R, T> Clone for Field<R, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R, T> Copy for Field<R, T> {}

impl<R, T> fmt::Debug for Field<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Field").field(&self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_simple_and_dotted_paths() {
        assert_eq!(FieldPath::parse("email").unwrap().json_path(), "$.email");
        assert_eq!(
            FieldPath::parse("lockout.end").unwrap().json_path(),
            "$.lockout.end"
        );
        assert!(FieldPath::parse("_private9").is_ok());
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", ".", "a..b", "a.", "9lives", "name'--", "a b", "$.a", "a[0]"] {
            assert!(
                matches!(FieldPath::parse(bad), Err(StoreError::InvalidFieldPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn lookup_walks_nested_objects() {
        let doc = json!({ "lockout": { "end": "2030-01-01T00:00:00Z" }, "name": "a" });
        let path = FieldPath::parse("lockout.end").unwrap();
        assert_eq!(path.lookup(&doc), Some(&json!("2030-01-01T00:00:00Z")));
        assert_eq!(FieldPath::parse("missing.end").unwrap().lookup(&doc), None);
    }

    #[test]
    fn typed_field_reports_malformed_path_on_use() {
        let bad: Field<(), String> = Field::new("not valid");
        assert!(bad.path().is_err());
        let good: Field<(), String> = Field::new("email");
        assert_eq!(good.path().unwrap().as_str(), "email");
    }
}
