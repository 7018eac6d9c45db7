use std::iter;
use std::sync::Arc;

use super::io::bolt::BoltRecordFields;
use crate::value::Value;

/// One row of a query result: the result's keys paired with this row's
/// values.
#[derive(Debug)]
pub struct Record {
    entries: Vec<(Arc<String>, Option<Value>)>,
}

impl Record {
    pub(crate) fn new(keys: &[Arc<String>], fields: BoltRecordFields) -> Self {
        assert_eq!(keys.len(), fields.len());
        Self {
            entries: iter::zip(keys.iter().map(Arc::clone), fields.into_iter().map(Some)).collect(),
        }
    }

    /// Iterate over the keys; same order as [`Record::values()`].
    /// Entries taken out with [`Record::take_value()`] are skipped.
    pub fn keys(&self) -> impl Iterator<Item = Arc<String>> + '_ {
        self.entries
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|_| Arc::clone(key)))
    }

    /// Iterate over the values; same order as [`Record::keys()`].
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries
            .iter()
            .filter_map(|(_, value)| value.as_ref())
    }

    /// Iterate over `(key, value)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (Arc<String>, &Value)> {
        self.entries
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|value| (Arc::clone(key), value)))
    }

    /// Turn the record into its values.
    pub fn into_values(self) -> impl Iterator<Item = Value> {
        self.entries.into_iter().filter_map(|(_, value)| value)
    }

    /// Get the value for `key`, if present.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .and_then(|(_, value)| value.as_ref())
    }

    /// Remove and return the value for `key`, if present.
    ///
    /// Useful to avoid cloning when only some values are of interest.
    pub fn take_value(&mut self, key: &str) -> Option<Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k.as_str() == key)
            .and_then(|(_, value)| value.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value;

    fn record() -> Record {
        let keys = vec![Arc::new("a".to_string()), Arc::new("b".to_string())];
        Record::new(&keys, vec![value!(1), value!("two")])
    }

    #[test]
    fn lookup_by_key() {
        let record = record();
        assert_eq!(record.value("a"), Some(&value!(1)));
        assert_eq!(record.value("b"), Some(&value!("two")));
        assert_eq!(record.value("c"), None);
    }

    #[test]
    fn take_value_removes_entry() {
        let mut record = record();
        assert_eq!(record.take_value("a"), Some(value!(1)));
        assert_eq!(record.take_value("a"), None);
        assert_eq!(record.keys().count(), 1);
        assert_eq!(record.values().count(), 1);
    }

    #[test]
    fn keys_and_values_align() {
        let record = record();
        let keys: Vec<_> = record.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        let values: Vec<_> = record.into_values().collect();
        assert_eq!(values, vec![value!(1), value!("two")]);
    }
}
