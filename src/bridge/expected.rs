//! Expected-value queue

use serde_json::Value;

/// Values sent by the bridge whose echo has not arrived yet
///
/// A multiset: entries are matched by equality, not arrival order, and
/// [`take`](Self::take) removes a single entry even when several are equal.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExpectedValues {
    values: Vec<Value>,
}

impl ExpectedValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a value whose echo will arrive later
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Consume one entry equal to `value`; false if none was expected
    pub fn take(&mut self, value: &Value) -> bool {
        match self.values.iter().position(|v| v == value) {
            Some(index) => {
                self.values.remove(index);
                true
            }
            None => false,
        }
    }

    /// Move every entry of `other` into this queue
    pub fn append(&mut self, mut other: ExpectedValues) {
        self.values.append(&mut other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_take_removes_single_entry() {
        let mut expected = ExpectedValues::new();
        expected.push(json!(50));
        expected.push(json!(50));

        assert!(expected.take(&json!(50)));
        assert_eq!(expected.len(), 1);
        assert!(expected.take(&json!(50)));
        assert!(!expected.take(&json!(50)));
        assert!(expected.is_empty());
    }

    #[test]
    fn test_take_matches_out_of_order() {
        let mut expected = ExpectedValues::new();
        expected.push(json!(1));
        expected.push(json!("two"));
        expected.push(json!({"three": 3}));

        assert!(expected.take(&json!({"three": 3})));
        assert!(expected.take(&json!(1)));
        assert!(!expected.take(&json!(2)));
        assert_eq!(expected.len(), 1);
    }

    #[test]
    fn test_append_keeps_duplicates() {
        let mut expected = ExpectedValues::new();
        expected.push(json!(1));
        let mut other = ExpectedValues::new();
        other.push(json!(1));
        other.push(json!(2));

        expected.append(other);
        assert_eq!(expected.len(), 3);
        assert!(expected.take(&json!(1)));
        assert!(expected.take(&json!(1)));
    }

    #[test]
    fn test_take_compares_types() {
        let mut expected = ExpectedValues::new();
        expected.push(json!(true));
        assert!(!expected.take(&json!(1)));
        assert!(!expected.take(&json!("true")));
        assert!(expected.take(&json!(true)));
    }
}
