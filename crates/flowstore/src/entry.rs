use chrono::{DateTime, Utc};
use flowcore::duration::format_duration;
use flowcore::{Context, Output};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;

/// Who wrote an entry: the id and reason of the writing context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedBy {
    pub id: String,
    pub reason: String,
}

impl From<&Context> for ModifiedBy {
    fn from(ctx: &Context) -> Self {
        Self {
            id: ctx.id().to_string(),
            reason: ctx.reason().to_string(),
        }
    }
}

/// A stored value with its write time and writer.
///
/// The payload is shared: handing an entry out never copies the value.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    data: Arc<Output>,
    timestamp: DateTime<Utc>,
    modified_by: Option<ModifiedBy>,
}

impl StoreEntry {
    pub fn new(data: Output, modified_by: Option<ModifiedBy>) -> Self {
        Self::at(data, Utc::now(), modified_by)
    }

    pub fn at(data: Output, timestamp: DateTime<Utc>, modified_by: Option<ModifiedBy>) -> Self {
        Self {
            data: Arc::new(data),
            timestamp,
            modified_by,
        }
    }

    pub(crate) fn written_by(data: Output, ctx: &Context) -> Self {
        Self::new(data, Some(ModifiedBy::from(ctx)))
    }

    pub fn data(&self) -> &Output {
        &self.data
    }

    pub fn shared_data(&self) -> Arc<Output> {
        Arc::clone(&self.data)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or_default()
    }

    pub fn is_older_than(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    pub fn modified_by(&self) -> Option<&ModifiedBy> {
        self.modified_by.as_ref()
    }

    pub fn modified_by_id(&self) -> &str {
        self.modified_by.as_ref().map(|m| m.id.as_str()).unwrap_or_default()
    }

    pub fn reason(&self) -> &str {
        self.modified_by
            .as_ref()
            .map(|m| m.reason.as_str())
            .unwrap_or_default()
    }

    pub fn is_error(&self) -> bool {
        self.data.is_error()
    }

    pub(crate) fn replace_data(&mut self, data: Output, modified_by: Option<ModifiedBy>) {
        self.data = Arc::new(data);
        self.modified_by = modified_by;
    }

    pub fn readable(&self) -> ReadableEntry {
        ReadableEntry {
            value: self.data.to_text(),
            raw_value: self.data.to_json(),
            age: format_duration(self.age()),
            modified_by: self.modified_by_id().to_string(),
            reason: self.reason().to_string(),
        }
    }
}

/// Serialized form of a [`StoreEntry`] with a human-readable age
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadableEntry {
    pub value: String,
    pub raw_value: serde_json::Value,
    pub age: String,
    pub modified_by: String,
    pub reason: String,
}

impl Serialize for StoreEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.readable().serialize(serializer)
    }
}

/// Filter for [`StoreNamespace::search`](crate::StoreNamespace::search).
/// Text patterns are case-insensitive substrings; unset fields match all.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub key: Option<String>,
    pub value: Option<String>,
    pub modified_by: Option<String>,
    pub min_age: Option<Duration>,
    pub max_age: Option<Duration>,
}

impl SearchQuery {
    pub fn matches(&self, key: &str, entry: &StoreEntry) -> bool {
        let age = entry.age();
        if self.min_age.is_some_and(|min| age < min) {
            return false;
        }
        if self.max_age.is_some_and(|max| age > max) {
            return false;
        }
        contains_ignore_case(key, self.key.as_deref())
            && contains_ignore_case(&entry.data.to_text(), self.value.as_deref())
            && contains_ignore_case(entry.modified_by_id(), self.modified_by.as_deref())
    }
}

fn contains_ignore_case(haystack: &str, needle: Option<&str>) -> bool {
    match needle {
        None | Some("") => true,
        Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_query() {
        let ctx = Context::new("test");
        let entry = StoreEntry::written_by(Output::plain("Kitchen Light"), &ctx);
        let query = SearchQuery {
            key: Some("LAMP".into()),
            value: Some("light".into()),
            ..Default::default()
        };
        assert!(query.matches("lamp.kitchen", &entry));
        assert!(!query.matches("switch", &entry));

        let young = SearchQuery {
            min_age: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert!(!young.matches("lamp", &entry));
    }

    #[test]
    fn test_readable_entry() {
        let ctx = Context::new("unit test");
        let entry = StoreEntry::written_by(Output::integer(7), &ctx);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["value"], "7");
        assert_eq!(json["rawValue"], 7);
        assert_eq!(json["reason"], "unit test");
        assert_eq!(json["modifiedBy"], ctx.id().to_string());
    }
}
