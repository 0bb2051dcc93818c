use crate::entry::{ModifiedBy, SearchQuery, StoreEntry};
use crate::error::{StoreError, StoreResult};
use crate::namespace::{claimed, mismatch, StoreNamespace, TransactionFn, Update};
use flowcore::{Context, Output};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct Slot {
    key: String,
    entry: StoreEntry,
}

/// Namespace held in process memory. Keys are case-insensitive; the casing
/// of the latest write is reported back.
#[derive(Default)]
pub struct MemoryNamespace {
    entries: Mutex<HashMap<String, Slot>>,
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write(entries: &mut HashMap<String, Slot>, key: &str, entry: StoreEntry) -> StoreEntry {
    entries.insert(
        key.to_lowercase(),
        Slot {
            key: key.to_string(),
            entry: entry.clone(),
        },
    );
    entry
}

impl StoreNamespace for MemoryNamespace {
    fn get(&self, key: &str) -> StoreResult<Option<StoreEntry>> {
        Ok(self.lock().get(&key.to_lowercase()).map(|s| s.entry.clone()))
    }

    fn set(&self, key: &str, value: Output, ctx: &Context) -> StoreResult<StoreEntry> {
        let mut entries = self.lock();
        Ok(write(&mut entries, key, StoreEntry::written_by(value, ctx)))
    }

    fn set_if_absent_or_older(
        &self,
        key: &str,
        value: Output,
        max_age: Duration,
        ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        let mut entries = self.lock();
        if let Some(slot) = entries.get(&key.to_lowercase()) {
            if !slot.entry.is_older_than(max_age) {
                return Err(claimed(key, &slot.entry));
            }
        }
        Ok(write(&mut entries, key, StoreEntry::written_by(value, ctx)))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: Output,
        ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        let mut entries = self.lock();
        let Some(slot) = entries.get(&key.to_lowercase()) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        if slot.entry.data().to_text() != expected {
            return Err(mismatch());
        }
        Ok(write(&mut entries, key, StoreEntry::written_by(value, ctx)))
    }

    fn update_transaction(
        &self,
        key: &str,
        f: &mut TransactionFn<'_>,
        ctx: &Context,
    ) -> StoreResult<Option<StoreEntry>> {
        let mut entries = self.lock();
        let current = entries.get(&key.to_lowercase()).map(|s| s.entry.clone());
        match f(current.as_ref()).map_err(StoreError::Aborted)? {
            Update::Unchanged => Ok(current),
            Update::Write(value) => Ok(Some(write(
                &mut entries,
                key,
                StoreEntry::written_by(value, ctx),
            ))),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.lock().remove(&key.to_lowercase());
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self.lock().values().map(|s| s.key.clone()).collect();
        keys.sort();
        Ok(keys)
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.lock().len())
    }

    fn all(&self, limit: usize) -> StoreResult<BTreeMap<String, Arc<Output>>> {
        let entries = self.lock();
        let all = entries.values().map(|s| (s.key.clone(), s.entry.shared_data()));
        Ok(match limit {
            0 => all.collect(),
            n => all.take(n).collect(),
        })
    }

    fn search(&self, query: &SearchQuery) -> StoreResult<BTreeMap<String, StoreEntry>> {
        Ok(self
            .lock()
            .values()
            .filter(|s| query.matches(&s.key, &s.entry))
            .map(|s| (s.key.clone(), s.entry.clone()))
            .collect())
    }

    fn delete_older(&self, max_age: Duration) -> StoreResult<usize> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, s| !s.entry.is_older_than(max_age));
        Ok(before - entries.len())
    }

    fn trim(&self, max_entries: usize) -> StoreResult<usize> {
        let mut entries = self.lock();
        if entries.len() <= max_entries {
            return Ok(0);
        }
        let mut by_age: Vec<(String, chrono::DateTime<chrono::Utc>)> = entries
            .iter()
            .map(|(k, s)| (k.clone(), s.entry.timestamp()))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1));
        let doomed = by_age.split_off(max_entries);
        for (key, _) in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len())
    }

    fn set_all(&self, values: BTreeMap<String, serde_json::Value>, ctx: &Context) -> StoreResult<usize> {
        let mut entries = self.lock();
        let count = values.len();
        for (key, value) in values {
            let entry = StoreEntry::new(Output::json(value), Some(ModifiedBy::from(ctx)));
            write(&mut entries, &key, entry);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_case_insensitive() {
        let ns = MemoryNamespace::new();
        let ctx = Context::new("test");
        ns.set("Lamp", Output::plain("on"), &ctx).unwrap();
        assert_eq!(ns.get("LAMP").unwrap().unwrap().data().to_text(), "on");
        assert_eq!(ns.keys().unwrap(), vec!["Lamp"]);
        ns.delete("lamp").unwrap();
        assert!(ns.get("Lamp").unwrap().is_none());
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let ns = MemoryNamespace::new();
        let ctx = Context::new("test");
        for i in 0..5 {
            ns.set(&format!("k{}", i), Output::integer(i), &ctx).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(ns.trim(2).unwrap(), 3);
        assert_eq!(ns.keys().unwrap(), vec!["k3", "k4"]);
        assert_eq!(ns.trim(10).unwrap(), 0);
    }
}
