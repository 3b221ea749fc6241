//! Single-field update operations.
//!
//! A [`FieldUpdate`] describes how to change exactly one field of a
//! document.  The new value is computed from the field's current value
//! only, so the store can apply it by reading and rewriting that one field
//! while holding its write lock, and never touches the rest of the
//! document.

use std::ops::RangeInclusive;

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::field::FieldPath;

/// Sub-field equalities used to pick elements out of a list of objects,
/// e.g. `{"login_provider": "github", "provider_key": "42"}`.
pub type ElementKey = Map<String, Value>;

/// Build an [`ElementKey`] from `(sub-field, value)` pairs.
pub fn element_key<const N: usize>(pairs: [(&str, Value); N]) -> ElementKey {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// What happens to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Overwrite the field.
    Set(Value),
    /// Remove the field from the document.
    Unset,
    /// Add to an integer field, treating a missing field as zero.  A result
    /// outside `bounds` is an error and leaves the field alone.
    Increment {
        by: i64,
        bounds: RangeInclusive<i64>,
    },
    /// Append to a list unless a structurally equal element is present.
    AddToSet(Value),
    /// Remove every structurally equal element from a list.
    Pull(Value),
    /// Remove every list element whose sub-fields match the key.
    PullWhere(ElementKey),
    /// Replace the first element matching the key, or append.
    Upsert { key: ElementKey, element: Value },
    /// Replace the first element equal to `old` with `new`.
    ReplaceElement { old: Value, new: Value },
}

/// One update addressed at one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub path: FieldPath,
    pub op: UpdateOp,
}

/// Result of evaluating a [`FieldUpdate`] against the current value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Unchanged,
    Write(Value),
    Remove,
}

impl FieldUpdate {
    pub fn new(path: FieldPath, op: UpdateOp) -> Self {
        Self { path, op }
    }

    pub fn set(path: FieldPath, value: Value) -> Self {
        Self::new(path, UpdateOp::Set(value))
    }

    pub fn unset(path: FieldPath) -> Self {
        Self::new(path, UpdateOp::Unset)
    }

    pub fn increment(path: FieldPath, by: i64) -> Self {
        Self::increment_within(path, by, i64::MIN..=i64::MAX)
    }

    /// Increment a field whose stored type is narrower than `i64`.
    pub fn increment_within(path: FieldPath, by: i64, bounds: RangeInclusive<i64>) -> Self {
        Self::new(path, UpdateOp::Increment { by, bounds })
    }

    pub fn add_to_set(path: FieldPath, element: Value) -> Self {
        Self::new(path, UpdateOp::AddToSet(element))
    }

    pub fn pull(path: FieldPath, element: Value) -> Self {
        Self::new(path, UpdateOp::Pull(element))
    }

    pub fn pull_where(path: FieldPath, key: ElementKey) -> Self {
        Self::new(path, UpdateOp::PullWhere(key))
    }

    pub fn upsert(path: FieldPath, key: ElementKey, element: Value) -> Self {
        Self::new(path, UpdateOp::Upsert { key, element })
    }

    pub fn replace_element(path: FieldPath, old: Value, new: Value) -> Self {
        Self::new(path, UpdateOp::ReplaceElement { old, new })
    }

    /// Compute the field's new state.  `current` is `None` when the field is
    /// absent or JSON `null`.
    pub fn evaluate(&self, current: Option<&Value>) -> Result<FieldChange> {
        let change = match &self.op {
            UpdateOp::Set(value) => {
                if current == Some(value) {
                    FieldChange::Unchanged
                } else {
                    FieldChange::Write(value.clone())
                }
            }
            UpdateOp::Unset => match current {
                None => FieldChange::Unchanged,
                Some(_) => FieldChange::Remove,
            },
            UpdateOp::Increment { by, bounds } => {
                let base = match current {
                    None => 0,
                    Some(v) => v.as_i64().ok_or_else(|| self.shape_error("an integer", v))?,
                };
                let total = base
                    .checked_add(*by)
                    .filter(|total| bounds.contains(total))
                    .ok_or_else(|| {
                        StoreError::InvalidDocument(format!(
                            "incrementing field {} by {by} overflows its range",
                            self.path
                        ))
                    })?;
                FieldChange::Write(Value::from(total))
            }
            UpdateOp::AddToSet(element) => {
                let mut list = self.list(current)?;
                if list.contains(element) {
                    FieldChange::Unchanged
                } else {
                    list.push(element.clone());
                    FieldChange::Write(Value::Array(list))
                }
            }
            UpdateOp::Pull(element) => self.retain(current, |e| e != element)?,
            UpdateOp::PullWhere(key) => self.retain(current, |e| !matches_key(e, key))?,
            UpdateOp::Upsert { key, element } => {
                let mut list = self.list(current)?;
                match list.iter().position(|e| matches_key(e, key)) {
                    Some(i) if &list[i] == element => FieldChange::Unchanged,
                    Some(i) => {
                        list[i] = element.clone();
                        FieldChange::Write(Value::Array(list))
                    }
                    None => {
                        list.push(element.clone());
                        FieldChange::Write(Value::Array(list))
                    }
                }
            }
            UpdateOp::ReplaceElement { old, new } => {
                let mut list = self.list(current)?;
                match list.iter().position(|e| e == old) {
                    Some(i) if old != new => {
                        list[i] = new.clone();
                        FieldChange::Write(Value::Array(list))
                    }
                    _ => FieldChange::Unchanged,
                }
            }
        };
        Ok(change)
    }

    fn list(&self, current: Option<&Value>) -> Result<Vec<Value>> {
        match current {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(other) => Err(self.shape_error("a list", other)),
        }
    }

    fn retain(
        &self,
        current: Option<&Value>,
        keep: impl Fn(&Value) -> bool,
    ) -> Result<FieldChange> {
        let list = self.list(current)?;
        let before = list.len();
        let kept: Vec<Value> = list.into_iter().filter(|e| keep(e)).collect();
        if kept.len() == before {
            Ok(FieldChange::Unchanged)
        } else {
            Ok(FieldChange::Write(Value::Array(kept)))
        }
    }

    fn shape_error(&self, expected: &str, found: &Value) -> StoreError {
        StoreError::InvalidDocument(format!(
            "field {} should be {expected}, found {found}",
            self.path
        ))
    }
}

/// Whether `element` is an object whose sub-fields equal every entry of `key`.
pub fn matches_key(element: &Value, key: &ElementKey) -> bool {
    key.iter().all(|(k, v)| element.get(k) == Some(v))
}
