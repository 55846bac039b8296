//! Query-by-filter model for the document store.
//!
//! A filter is a conjunction of comparisons on top-level document fields,
//! optional ordering and an optional limit. Numbers compare numerically,
//! strings lexicographically; comparisons between different JSON types never
//! match.

use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
}

impl Condition {
    fn matches(&self, document: &Value) -> bool {
        let (field, expected) = match self {
            Self::Eq(f, v)
            | Self::Ne(f, v)
            | Self::Lt(f, v)
            | Self::Lte(f, v)
            | Self::Gt(f, v)
            | Self::Gte(f, v) => (f, v),
        };
        let actual = document.get(field.as_str()).unwrap_or(&Value::Null);
        let ordering = compare_values(actual, expected);
        match self {
            Self::Eq(..) => ordering == Some(Ordering::Equal),
            Self::Ne(..) => ordering != Some(Ordering::Equal),
            Self::Lt(..) => ordering == Some(Ordering::Less),
            Self::Lte(..) => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Self::Gt(..) => ordering == Some(Ordering::Greater),
            Self::Gte(..) => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
    order_by: Vec<(String, SortOrder)>,
    limit: Option<usize>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    pub fn ne(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Ne(field.to_string(), value.into()));
        self
    }

    pub fn lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lt(field.to_string(), value.into()));
        self
    }

    pub fn lte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lte(field.to_string(), value.into()));
        self
    }

    pub fn gt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gt(field.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gte(field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, order: SortOrder) -> Self {
        self.order_by.push((field.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(document))
    }

    /// Apply this filter to documents already in key order.
    pub fn apply<'a, I>(&self, documents: I) -> Vec<(String, Value)>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut selected: Vec<(String, Value)> = documents
            .into_iter()
            .filter(|(_, doc)| self.matches(doc))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect();

        if !self.order_by.is_empty() {
            // stable sort: ties keep key order
            selected.sort_by(|(_, a), (_, b)| self.compare_documents(a, b));
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }

    fn compare_documents(&self, a: &Value, b: &Value) -> Ordering {
        for (field, order) in &self.order_by {
            let left = a.get(field.as_str()).unwrap_or(&Value::Null);
            let right = b.get(field.as_str()).unwrap_or(&Value::Null);
            let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
            let ordering = match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                Some(x.cmp(&y))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<(String, Value)> {
        vec![
            ("a".into(), json!({"depth": 2, "priority": 1, "status": "pending"})),
            ("b".into(), json!({"depth": 0, "priority": 3, "status": "pending"})),
            ("c".into(), json!({"depth": 0, "priority": 1, "status": "failed"})),
            ("d".into(), json!({"depth": 1, "priority": 0, "status": "pending"})),
        ]
    }

    #[test]
    fn conjunction_with_ordering_and_limit() {
        let docs = docs();
        let filter = Filter::all()
            .eq("status", "pending")
            .order_by("depth", SortOrder::Asc)
            .order_by("priority", SortOrder::Asc)
            .limit(2);
        let selected = filter.apply(docs.iter().map(|(k, v)| (k, v)));
        let keys: Vec<_> = selected.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "d"]);
    }

    #[test]
    fn mismatched_types_never_match() {
        let doc = json!({"ts": "100"});
        assert!(!Filter::all().lt("ts", 200).matches(&doc));
        assert!(Filter::all().ne("ts", 200).matches(&doc));
    }

    #[test]
    fn missing_field_compares_as_null() {
        let doc = json!({"other": 1});
        assert!(Filter::all().eq("absent", Value::Null).matches(&doc));
        assert!(!Filter::all().gte("absent", 0).matches(&doc));
    }
}
