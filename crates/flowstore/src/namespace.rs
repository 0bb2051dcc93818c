use crate::entry::{SearchQuery, StoreEntry};
use crate::error::{StoreError, StoreResult};
use flowcore::duration::format_duration;
use flowcore::{Context, Output};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Decision of an [`StoreNamespace::update_transaction`] function
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Store this value under the key
    Write(Output),
    /// Leave the current entry as it is
    Unchanged,
}

/// Body of a read-modify-write transaction. Returning `Err` aborts the
/// transaction; the output is handed back to the caller verbatim.
pub type TransactionFn<'a> = dyn FnMut(Option<&StoreEntry>) -> Result<Update, Output> + 'a;

/// An independently locked key space.
///
/// Every call is a short synchronous critical section; implementations
/// never hold their lock across an `.await`.
pub trait StoreNamespace: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<StoreEntry>>;

    /// Like [`get`](Self::get), but an entry older than `max_age` is
    /// reported as gone
    fn get_if_younger(&self, key: &str, max_age: Duration) -> StoreResult<Option<StoreEntry>> {
        match self.get(key)? {
            Some(entry) if entry.is_older_than(max_age) => Err(gone(max_age)),
            other => Ok(other),
        }
    }

    fn set(&self, key: &str, value: Output, ctx: &Context) -> StoreResult<StoreEntry>;

    /// Writes only if the key is absent or its entry is older than
    /// `max_age`. Used to claim a key for a period of time.
    fn set_if_absent_or_older(
        &self,
        key: &str,
        value: Output,
        max_age: Duration,
        ctx: &Context,
    ) -> StoreResult<StoreEntry>;

    /// Writes only if the current value renders as `expected`
    fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: Output,
        ctx: &Context,
    ) -> StoreResult<StoreEntry>;

    /// Runs `f` on the current entry under the namespace lock and applies
    /// its decision. Returns the entry that is stored afterwards.
    fn update_transaction(
        &self,
        key: &str,
        f: &mut TransactionFn<'_>,
        ctx: &Context,
    ) -> StoreResult<Option<StoreEntry>>;

    fn delete(&self, key: &str) -> StoreResult<()>;

    fn keys(&self) -> StoreResult<Vec<String>>;

    fn len(&self) -> StoreResult<usize>;

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// All values, at most `limit` of them; `0` means no limit
    fn all(&self, limit: usize) -> StoreResult<BTreeMap<String, Arc<Output>>>;

    fn search(&self, query: &SearchQuery) -> StoreResult<BTreeMap<String, StoreEntry>>;

    /// Removes entries older than `max_age` and returns how many
    fn delete_older(&self, max_age: Duration) -> StoreResult<usize>;

    /// Keeps the `max_entries` most recent entries and returns how many
    /// were removed
    fn trim(&self, max_entries: usize) -> StoreResult<usize>;

    fn set_all(&self, values: BTreeMap<String, serde_json::Value>, ctx: &Context) -> StoreResult<usize>;
}

impl dyn StoreNamespace {
    /// [`update_transaction`](StoreNamespace::update_transaction) for a
    /// closure that runs once
    pub fn transaction<F>(&self, key: &str, ctx: &Context, f: F) -> StoreResult<Option<StoreEntry>>
    where
        F: FnOnce(Option<&StoreEntry>) -> Result<Update, Output>,
    {
        let mut f = Some(f);
        self.update_transaction(
            key,
            &mut |entry| match f.take() {
                Some(f) => f(entry),
                None => Ok(Update::Unchanged),
            },
            ctx,
        )
    }
}

pub(crate) fn gone(max_age: Duration) -> StoreError {
    StoreError::Gone(format!("Entry is older than {}", format_duration(max_age)))
}

pub(crate) fn claimed(key: &str, entry: &StoreEntry) -> StoreError {
    StoreError::Conflict(format!(
        "{} already exists and is only {} old",
        key,
        format_duration(entry.age())
    ))
}

pub(crate) fn mismatch() -> StoreError {
    StoreError::Conflict("old value is different from expectation".to_string())
}
