//! Document predicates and their translation to SQLite JSON expressions.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::field::FieldPath;
use crate::update::ElementKey;

/// A predicate over stored documents.
///
/// Comparison values must be scalars (string, number, boolean).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(FieldPath, Value),
    /// Field present and not `null`.
    Exists(FieldPath),
    /// Field absent or `null`.
    Missing(FieldPath),
    /// List field contains the scalar.
    Contains(FieldPath, Value),
    /// List field contains an object whose sub-fields equal the key.
    ElementMatch(FieldPath, ElementKey),
    And(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Render as a SQL boolean expression over the document column `doc`,
    /// pushing bound parameters in order.
    pub(crate) fn to_sql(&self, doc: &str, params: &mut Vec<SqlValue>) -> Result<String> {
        let sql = match self {
            Filter::All => "1".to_string(),
            Filter::Eq(path, value) => {
                params.push(SqlValue::Text(path.json_path()));
                params.push(scalar(value)?);
                format!("json_extract({doc}, ?) = ?")
            }
            Filter::Exists(path) => {
                params.push(SqlValue::Text(path.json_path()));
                format!("COALESCE(json_type({doc}, ?), 'null') != 'null'")
            }
            Filter::Missing(path) => {
                params.push(SqlValue::Text(path.json_path()));
                format!("COALESCE(json_type({doc}, ?), 'null') = 'null'")
            }
            Filter::Contains(path, value) => {
                params.push(SqlValue::Text(path.json_path()));
                params.push(scalar(value)?);
                format!("EXISTS (SELECT 1 FROM json_each({doc}, ?) AS e WHERE e.value = ?)")
            }
            Filter::ElementMatch(path, key) => {
                if key.is_empty() {
                    return Err(StoreError::InvalidFilter(format!(
                        "element match on {path} needs at least one sub-field"
                    )));
                }
                params.push(SqlValue::Text(path.json_path()));
                let mut clauses = Vec::with_capacity(key.len());
                for (sub, value) in key {
                    let sub = FieldPath::parse(sub)
                        .map_err(|_| StoreError::InvalidFilter(format!("bad sub-field {sub:?}")))?;
                    params.push(SqlValue::Text(sub.json_path()));
                    params.push(scalar(value)?);
                    clauses.push("json_extract(e.value, ?) = ?");
                }
                format!(
                    "EXISTS (SELECT 1 FROM json_each({doc}, ?) AS e \
                     WHERE e.type = 'object' AND {})",
                    clauses.join(" AND ")
                )
            }
            Filter::And(filters) => {
                if filters.is_empty() {
                    return Ok("1".to_string());
                }
                let parts = filters
                    .iter()
                    .map(|f| f.to_sql(doc, params).map(|s| format!("({s})")))
                    .collect::<Result<Vec<_>>>()?;
                parts.join(" AND ")
            }
            Filter::Not(inner) => format!("NOT ({})", inner.to_sql(doc, params)?),
        };
        Ok(sql)
    }
}

fn scalar(value: &Value) -> Result<SqlValue> {
    match value {
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        // json_extract yields 1/0 for JSON booleans.
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .ok_or_else(|| StoreError::InvalidFilter(format!("unrepresentable number {n}"))),
        other => Err(StoreError::InvalidFilter(format!(
            "comparison value must be a scalar, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::element_key;
    use serde_json::json;

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    #[test]
    fn eq_binds_path_then_value() {
        let mut params = Vec::new();
        let sql = Filter::Eq(path("normalized_email"), json!("A@B.C"))
            .to_sql("d.body", &mut params)
            .unwrap();
        assert_eq!(sql, "json_extract(d.body, ?) = ?");
        assert_eq!(
            params,
            vec![
                SqlValue::Text("$.normalized_email".into()),
                SqlValue::Text("A@B.C".into())
            ]
        );
    }

    #[test]
    fn nested_and_not_parenthesise() {
        let mut params = Vec::new();
        let filter = Filter::and([
            Filter::Exists(path("authenticator_key")),
            Filter::not(Filter::ElementMatch(
                path("tokens"),
                element_key([("name", json!("AuthenticatorKey"))]),
            )),
        ]);
        let sql = filter.to_sql("d.body", &mut params).unwrap();
        assert!(sql.starts_with(
            "(COALESCE(json_type(d.body, ?), 'null') != 'null') AND (NOT (EXISTS"
        ));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn booleans_bind_as_integers() {
        let mut params = Vec::new();
        Filter::Eq(path("email_confirmed"), json!(true))
            .to_sql("body", &mut params)
            .unwrap();
        assert_eq!(params[1], SqlValue::Integer(1));
    }

    #[test]
    fn non_scalar_comparisons_are_rejected() {
        let mut params = Vec::new();
        for value in [json!(null), json!([1]), json!({ "a": 1 })] {
            let err = Filter::Eq(path("x"), value).to_sql("body", &mut params);
            assert!(matches!(err, Err(StoreError::InvalidFilter(_))));
        }
        let err = Filter::ElementMatch(path("x"), ElementKey::new()).to_sql("body", &mut params);
        assert!(matches!(err, Err(StoreError::InvalidFilter(_))));
    }

    #[test]
    fn empty_and_matches_everything() {
        let mut params = Vec::new();
        assert_eq!(Filter::And(vec![]).to_sql("body", &mut params).unwrap(), "1");
        assert!(params.is_empty());
    }
}
