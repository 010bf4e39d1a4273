use std::collections::BTreeMap;

use serde_json::Value;

/// Equality filter for list queries, sent as query parameters and applied to
/// top-level payload fields when serving from the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    fields: BTreeMap<String, String>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn matches(&self, payload: &Value) -> bool {
        self.fields.iter().all(|(field, expected)| match payload.get(field) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == *expected,
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ListFilter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(ListFilter::new().matches(&json!({"a": 1})));
        assert!(ListFilter::new().matches(&Value::Null));
    }

    #[test]
    fn test_matches_strings_numbers_and_bools() {
        let payload = json!({"status": "approved", "grade": 40, "retest": false});
        assert!(ListFilter::new().with("status", "approved").matches(&payload));
        assert!(ListFilter::new().with("grade", "40").matches(&payload));
        assert!(ListFilter::new().with("retest", "false").matches(&payload));
        assert!(!ListFilter::new().with("status", "rejected").matches(&payload));
        assert!(!ListFilter::new().with("missing", "x").matches(&payload));
    }
}
