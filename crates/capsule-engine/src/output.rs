use indexmap::IndexMap;
use serde::Serialize;

/// Named step results, in first-write order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OutputTable {
    slots: IndexMap<String, serde_json::Value>,
}

impl OutputTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning `true` when an earlier value was replaced.
    ///
    /// A replaced slot keeps its original position.
    pub fn insert(&mut self, slot: impl Into<String>, value: serde_json::Value) -> bool {
        self.slots.insert(slot.into(), value).is_some()
    }

    pub fn get(&self, slot: &str) -> Option<&serde_json::Value> {
        self.slots.get(slot)
    }

    pub fn contains(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn slot_names(&self) -> Vec<&str> {
        self.slots.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overwrite_is_reported_and_keeps_position() {
        let mut table = OutputTable::new();
        assert!(!table.insert("a", json!(1)));
        assert!(!table.insert("b", json!(2)));
        assert!(table.insert("a", json!(3)));
        assert_eq!(table.slot_names(), vec!["a", "b"]);
        assert_eq!(table.get("a"), Some(&json!(3)));
    }

    #[test]
    fn test_serializes_as_object() {
        let mut table = OutputTable::new();
        table.insert("draft", json!({"draft": "x"}));
        assert_eq!(
            serde_json::to_value(&table).unwrap(),
            json!({"draft": {"draft": "x"}})
        );
    }
}
