//! Serializable description of a backing-store query.
//!
//! A [`ListQuery`] is what a rebuild job carries across the job runner boundary, and its canonical form is what
//! scopes a cached snapshot: two logically identical queries always yield the same `data_id`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use std::cmp::Ordering;

use crate::error::Result;
use crate::types::Record;

pub const QUERY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// The filter value is an array; matches when the field equals any of its elements.
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op:    FilterOp,
    pub value: Value,
}

impl Filter {
    fn sort_key(&self) -> (&str, FilterOp, String) {
        (&self.field, self.op, self.value.to_string())
    }

    pub fn matches(&self, record: &Record) -> bool {
        let field = record.field(&self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => values_equal(field, &self.value),
            FilterOp::Ne => !values_equal(field, &self.value),
            FilterOp::Lt => compare_values(field, &self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare_values(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(field, &self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare_values(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.iter().any(|c| values_equal(field, c))),
        }
    }
}

/// Versioned query descriptor: which entity kind to read and which filters a record must pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    pub version:     u32,
    pub entity_type: String,
    #[serde(default)]
    pub filters:     Vec<Filter>,
}

impl ListQuery {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            version:     QUERY_VERSION,
            entity_type: entity_type.into(),
            filters:     Vec::new(),
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    #[inline]
    pub fn filter_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    /// Deterministic string form. Filter order does not matter; object keys come out sorted. Numbers that compare
    /// equal, like `1` and `1.0`, are written the same way.
    pub fn canonical(&self) -> Result<String> {
        let mut canonical = self.clone();
        for filter in canonical.filters.iter_mut() {
            normalize_numbers(&mut filter.value);
        }
        canonical.filters.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        canonical.filters.dedup();
        Ok(serde_json::to_string(&canonical)?)
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.entity_type == self.entity_type && self.filters.iter().all(|f| f.matches(record))
    }

    /// The key of the cached snapshot of list `list_id` restricted to this query.
    pub fn data_id(&self, list_id: &str) -> Result<String> {
        let digest = Sha256::digest(self.canonical()?.as_bytes());
        Ok(format!("{list_id}:{}", hex::encode(digest)))
    }
}

// Floats with no fractional part become integers, so that canonical forms agree with `values_equal`.
fn normalize_numbers(value: &mut Value) {
    let integral = match value {
        Value::Number(number) if number.is_f64() => number
            .as_f64()
            .filter(|float| float.fract() == 0.0 && *float >= i64::MIN as f64 && *float < i64::MAX as f64),
        Value::Array(items) => {
            items.iter_mut().for_each(normalize_numbers);
            None
        }
        Value::Object(fields) => {
            fields.values_mut().for_each(normalize_numbers);
            None
        }
        _ => None,
    };
    if let Some(float) = integral {
        *value = Value::from(float as i64);
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(key: &str, status: &str, score: i64) -> Record {
        Record::new("Project", key)
            .with_field("status", status)
            .with_field("score", score)
    }

    #[test]
    fn filter_order_does_not_change_identity() {
        let a = ListQuery::new("Project").filter_eq("org", "org-1").filter_eq("status", "accepted");
        let b = ListQuery::new("Project").filter_eq("status", "accepted").filter_eq("org", "org-1");
        assert_eq!(a.canonical().unwrap(), b.canonical().unwrap());
        assert_eq!(a.data_id("projects").unwrap(), b.data_id("projects").unwrap());
    }

    #[test]
    fn different_queries_get_different_slots() {
        let a = ListQuery::new("Project").filter_eq("org", "org-1");
        let b = ListQuery::new("Project").filter_eq("org", "org-2");
        assert_ne!(a.data_id("projects").unwrap(), b.data_id("projects").unwrap());
        assert_ne!(a.data_id("projects").unwrap(), a.data_id("tasks").unwrap());
        assert!(a.data_id("projects").unwrap().starts_with("projects:"));
    }

    #[test]
    fn equal_numbers_share_identity() {
        let int = ListQuery::new("Project").filter_eq("score", 1);
        let float = ListQuery::new("Project").filter_eq("score", 1.0);
        assert_eq!(int.data_id("projects").unwrap(), float.data_id("projects").unwrap());

        let ints = ListQuery::new("Project").filter("score", FilterOp::In, json!([1, 2]));
        let floats = ListQuery::new("Project").filter("score", FilterOp::In, json!([1.0, 2.0]));
        assert_eq!(ints.canonical().unwrap(), floats.canonical().unwrap());

        let half = ListQuery::new("Project").filter_eq("score", 1.5);
        assert_ne!(int.data_id("projects").unwrap(), half.data_id("projects").unwrap());
        assert!(float.matches(&project("p1", "accepted", 1)));
    }

    #[test]
    fn filters_select_records() {
        let query = ListQuery::new("Project")
            .filter_eq("status", "accepted")
            .filter("score", FilterOp::Ge, 10);

        assert!(query.matches(&project("p1", "accepted", 10)));
        assert!(!query.matches(&project("p2", "accepted", 9)));
        assert!(!query.matches(&project("p3", "withdrawn", 50)));
        assert!(!query.matches(&Record::new("Task", "t1").with_field("status", "accepted")));

        let any_of = ListQuery::new("Project").filter("status", FilterOp::In, json!(["accepted", "failed"]));
        assert!(any_of.matches(&project("p4", "failed", 0)));
        assert!(!any_of.matches(&project("p5", "withdrawn", 0)));
    }

    #[test]
    fn missing_fields_compare_as_null() {
        let query = ListQuery::new("Project").filter("mentor", FilterOp::Ne, Value::Null);
        assert!(!query.matches(&project("p1", "accepted", 1)));
        assert!(query.matches(&project("p2", "accepted", 1).with_field("mentor", "alice")));
    }
}
