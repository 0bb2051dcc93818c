use crate::entry::{ModifiedBy, SearchQuery, StoreEntry};
use crate::error::{StoreError, StoreResult};
use crate::namespace::{claimed, mismatch, StoreNamespace, TransactionFn, Update};
use flowcore::{Context, Output};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const MAX_SEARCH_RESULTS: usize = 200;

#[derive(Default)]
struct Log {
    /// Oldest first; trimming pops from the front
    entries: VecDeque<StoreEntry>,
    /// Number of entries trimmed from the front so far; keys stay stable
    offset: usize,
}

impl Log {
    fn index(&self, key: &str) -> StoreResult<Option<usize>> {
        let absolute: usize = key
            .trim()
            .parse()
            .map_err(|_| StoreError::BadRequest(format!("{} is not a valid key", key)))?;
        Ok(absolute
            .checked_sub(self.offset)
            .filter(|i| *i < self.entries.len()))
    }

    fn key_of(&self, index: usize) -> String {
        let last = (self.entries.len() + self.offset).saturating_sub(1);
        let width = last.to_string().len();
        format!("{:0width$}", index + self.offset, width = width)
    }

    fn trim(&mut self, keep: usize) -> usize {
        if keep >= self.entries.len() {
            return 0;
        }
        let cut = self.entries.len() - keep;
        self.entries.drain(..cut);
        self.offset += cut;
        cut
    }
}

/// Append-only namespace with numeric keys.
///
/// Writing the empty key appends. Existing entries may be overwritten but
/// never deleted individually; old entries leave through `trim`,
/// `delete_older` or auto-trim.
pub struct LogNamespace {
    log: Mutex<Log>,
    auto_trim: usize,
}

impl LogNamespace {
    /// `auto_trim` > 0 bounds the log to roughly that many entries
    pub fn new(auto_trim: usize) -> Self {
        Self {
            log: Mutex::new(Log::default()),
            auto_trim,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, log: &mut Log, key: &str, value: Output, by: Option<ModifiedBy>) -> StoreResult<StoreEntry> {
        if key.is_empty() {
            let entry = StoreEntry::new(value, by);
            log.entries.push_back(entry.clone());
            if self.auto_trim > 0 && log.entries.len() % (self.auto_trim / 10).max(1) == 0 {
                log.trim(self.auto_trim);
            }
            return Ok(entry);
        }
        let index = log
            .index(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let entry = &mut log.entries[index];
        entry.replace_data(value, by);
        Ok(entry.clone())
    }
}

impl StoreNamespace for LogNamespace {
    fn get(&self, key: &str) -> StoreResult<Option<StoreEntry>> {
        let log = self.lock();
        Ok(log.index(key)?.map(|i| log.entries[i].clone()))
    }

    fn set(&self, key: &str, value: Output, ctx: &Context) -> StoreResult<StoreEntry> {
        let mut log = self.lock();
        self.write(&mut log, key, value, Some(ModifiedBy::from(ctx)))
    }

    fn set_if_absent_or_older(
        &self,
        key: &str,
        value: Output,
        max_age: Duration,
        ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        let mut log = self.lock();
        if !key.is_empty() {
            if let Some(i) = log.index(key)? {
                if !log.entries[i].is_older_than(max_age) {
                    return Err(claimed(key, &log.entries[i]));
                }
            }
        }
        self.write(&mut log, key, value, Some(ModifiedBy::from(ctx)))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: Output,
        ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        let mut log = self.lock();
        let index = log
            .index(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if log.entries[index].data().to_text() != expected {
            return Err(mismatch());
        }
        self.write(&mut log, key, value, Some(ModifiedBy::from(ctx)))
    }

    fn update_transaction(
        &self,
        key: &str,
        f: &mut TransactionFn<'_>,
        ctx: &Context,
    ) -> StoreResult<Option<StoreEntry>> {
        let mut log = self.lock();
        let current = if key.is_empty() {
            None
        } else {
            log.index(key)?.map(|i| log.entries[i].clone())
        };
        match f(current.as_ref()).map_err(StoreError::Aborted)? {
            Update::Unchanged => Ok(current),
            Update::Write(value) => self
                .write(&mut log, key, value, Some(ModifiedBy::from(ctx)))
                .map(Some),
        }
    }

    fn delete(&self, _key: &str) -> StoreResult<()> {
        Err(StoreError::unsupported("log", "delete"))
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let log = self.lock();
        Ok((0..log.entries.len()).map(|i| log.key_of(i)).collect())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.lock().entries.len())
    }

    fn all(&self, limit: usize) -> StoreResult<BTreeMap<String, Arc<Output>>> {
        let log = self.lock();
        let take = if limit == 0 { log.entries.len() } else { limit };
        Ok(log
            .entries
            .iter()
            .enumerate()
            .take(take)
            .map(|(i, e)| (log.key_of(i), e.shared_data()))
            .collect())
    }

    fn search(&self, query: &SearchQuery) -> StoreResult<BTreeMap<String, StoreEntry>> {
        let log = self.lock();
        Ok(log
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (log.key_of(i), e))
            .filter(|(key, e)| query.matches(key, e))
            .take(MAX_SEARCH_RESULTS)
            .map(|(key, e)| (key, e.clone()))
            .collect())
    }

    fn delete_older(&self, max_age: Duration) -> StoreResult<usize> {
        let mut log = self.lock();
        let old = log
            .entries
            .iter()
            .take_while(|e| e.is_older_than(max_age))
            .count();
        let keep = log.entries.len() - old;
        Ok(log.trim(keep))
    }

    fn trim(&self, max_entries: usize) -> StoreResult<usize> {
        Ok(self.lock().trim(max_entries))
    }

    fn set_all(&self, values: BTreeMap<String, serde_json::Value>, ctx: &Context) -> StoreResult<usize> {
        let mut log = self.lock();
        let count = values.len();
        for (key, value) in values {
            self.write(&mut log, &key, Output::json(value), Some(ModifiedBy::from(ctx)))?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_zero_padded_and_survive_trim() {
        let ns = LogNamespace::new(0);
        let ctx = Context::new("test");
        for i in 0..12 {
            ns.set("", Output::integer(i), &ctx).unwrap();
        }
        let keys = ns.keys().unwrap();
        assert_eq!(keys.first().map(String::as_str), Some("00"));
        assert_eq!(keys.last().map(String::as_str), Some("11"));

        assert_eq!(ns.trim(4).unwrap(), 8);
        assert_eq!(ns.keys().unwrap(), vec!["08", "09", "10", "11"]);
        assert_eq!(ns.get("9").unwrap().unwrap().data().to_text(), "9");
        assert!(ns.get("3").unwrap().is_none());
    }

    #[test]
    fn test_auto_trim() {
        let ns = LogNamespace::new(10);
        let ctx = Context::new("test");
        for i in 0..25 {
            ns.set("", Output::integer(i), &ctx).unwrap();
        }
        assert!(ns.len().unwrap() <= 10);
    }

    #[test]
    fn test_appends_after_repeated_trims_keep_their_keys() {
        let ns = LogNamespace::new(0);
        let ctx = Context::new("test");
        for round in 0..5 {
            for i in 0..10 {
                ns.set("", Output::integer(round * 10 + i), &ctx).unwrap();
            }
            assert_eq!(ns.trim(3).unwrap(), if round == 0 { 7 } else { 10 });
        }
        assert_eq!(ns.keys().unwrap(), vec!["47", "48", "49"]);
        assert_eq!(ns.get("48").unwrap().unwrap().data().to_text(), "48");
        let all = ns.all(0).unwrap();
        assert_eq!(all["47"].to_text(), "47");
    }

    #[test]
    fn test_invalid_key_and_delete() {
        let ns = LogNamespace::new(0);
        let err = ns.get("abc").unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(ns.delete("0").unwrap_err().status_code(), 501);
    }
}
