use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Case-insensitive, multi-valued argument map.
///
/// Lookups ignore case; the casing of the first insertion of a key is kept
/// so it can be shown back to users or passed on unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, RawArgument>", into = "BTreeMap<String, String>")]
pub struct FunctionArguments {
    entries: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: String,
    values: Vec<String>,
}

impl FunctionArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    /// First value given for the key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_lowercase())
            .and_then(|e| e.values.first())
            .map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&key.to_lowercase())
            .map(|e| e.values.as_slice())
            .unwrap_or(&[])
    }

    /// All values of the key joined with `,`
    pub fn get_combined(&self, key: &str) -> Option<String> {
        self.entries
            .get(&key.to_lowercase())
            .map(|e| e.values.join(","))
    }

    /// Replaces all values of the key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.get_mut(&key.to_lowercase()) {
            Some(entry) => entry.values = vec![value],
            None => {
                self.entries.insert(
                    key.to_lowercase(),
                    Entry {
                        key,
                        values: vec![value],
                    },
                );
            }
        }
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries
            .entry(key.to_lowercase())
            .or_insert_with(|| Entry {
                key,
                values: Vec::new(),
            })
            .values
            .push(value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(&key.to_lowercase()).map(|e| e.values)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in their original casing
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|e| e.key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .values()
            .map(|e| (e.key.as_str(), e.values.as_slice()))
    }

    pub fn original_case_map(&self) -> BTreeMap<String, String> {
        self.entries
            .values()
            .map(|e| (e.key.clone(), e.values.join(",")))
            .collect()
    }

    pub fn lower_case_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(lower, e)| (lower.clone(), e.values.join(",")))
            .collect()
    }

    /// Overlays `other` on top of `self`, returning the keys that already
    /// existed and were replaced
    pub fn merge_from(&mut self, other: &FunctionArguments) -> Vec<String> {
        let mut replaced = Vec::new();
        for (lower, entry) in &other.entries {
            if self.entries.contains_key(lower) {
                replaced.push(entry.key.clone());
            }
            self.entries.insert(lower.clone(), entry.clone());
        }
        replaced
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FunctionArguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = FunctionArguments::new();
        for (key, value) in iter {
            args.append(key, value);
        }
        args
    }
}

impl From<HashMap<String, String>> for FunctionArguments {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<BTreeMap<String, String>> for FunctionArguments {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

/// Argument values as they appear in stored flow documents
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawArgument {
    Many(Vec<String>),
    One(String),
    Other(serde_json::Value),
}

impl From<BTreeMap<String, RawArgument>> for FunctionArguments {
    fn from(map: BTreeMap<String, RawArgument>) -> Self {
        let mut args = FunctionArguments::new();
        for (key, raw) in map {
            match raw {
                RawArgument::Many(values) => {
                    for value in values {
                        args.append(key.clone(), value);
                    }
                }
                RawArgument::One(value) => args.append(key, value),
                RawArgument::Other(value) => args.append(key, value.to_string()),
            }
        }
        args
    }
}

impl From<FunctionArguments> for BTreeMap<String, String> {
    fn from(args: FunctionArguments) -> Self {
        args.original_case_map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case_and_keeps_original() {
        let mut args = FunctionArguments::new();
        args.set("DeviceName", "lamp");
        assert!(args.has("devicename"));
        assert_eq!(args.get("DEVICENAME"), Some("lamp"));
        assert_eq!(args.keys().collect::<Vec<_>>(), vec!["DeviceName"]);
    }

    #[test]
    fn test_multi_values_are_combined() {
        let args: FunctionArguments = vec![("tag", "a"), ("Tag", "b")].into_iter().collect();
        assert_eq!(args.get("tag"), Some("a"));
        assert_eq!(args.get_combined("TAG").as_deref(), Some("a,b"));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_merge_reports_overwritten_keys() {
        let mut base = FunctionArguments::new().with("key", "1").with("ns", "x");
        let other = FunctionArguments::new().with("KEY", "2");
        let replaced = base.merge_from(&other);
        assert_eq!(replaced, vec!["KEY".to_string()]);
        assert_eq!(base.get("key"), Some("2"));
    }

    #[test]
    fn test_deserialize_mixed_values() {
        let args: FunctionArguments =
            serde_json::from_str(r#"{"key":"k","count":3,"tags":["a","b"]}"#).unwrap();
        assert_eq!(args.get("count"), Some("3"));
        assert_eq!(args.get_all("tags").len(), 2);
    }
}
