use crate::entry::{SearchQuery, StoreEntry};
use crate::error::{StoreError, StoreResult};
use crate::namespace::{StoreNamespace, TransactionFn};
use flowcore::{Context, Output};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Namespace that accepts every write and forgets it immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNamespace;

impl StoreNamespace for NullNamespace {
    fn get(&self, _key: &str) -> StoreResult<Option<StoreEntry>> {
        Ok(None)
    }

    fn set(&self, _key: &str, value: Output, ctx: &Context) -> StoreResult<StoreEntry> {
        Ok(StoreEntry::written_by(value, ctx))
    }

    fn set_if_absent_or_older(
        &self,
        _key: &str,
        value: Output,
        _max_age: Duration,
        ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        Ok(StoreEntry::written_by(value, ctx))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        _expected: &str,
        _value: Output,
        _ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        Err(StoreError::NotFound(key.to_string()))
    }

    fn update_transaction(
        &self,
        _key: &str,
        f: &mut TransactionFn<'_>,
        _ctx: &Context,
    ) -> StoreResult<Option<StoreEntry>> {
        f(None).map_err(StoreError::Aborted)?;
        Ok(None)
    }

    fn delete(&self, _key: &str) -> StoreResult<()> {
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(0)
    }

    fn all(&self, _limit: usize) -> StoreResult<BTreeMap<String, Arc<Output>>> {
        Ok(BTreeMap::new())
    }

    fn search(&self, _query: &SearchQuery) -> StoreResult<BTreeMap<String, StoreEntry>> {
        Ok(BTreeMap::new())
    }

    fn delete_older(&self, _max_age: Duration) -> StoreResult<usize> {
        Ok(0)
    }

    fn trim(&self, _max_entries: usize) -> StoreResult<usize> {
        Ok(0)
    }

    fn set_all(&self, values: BTreeMap<String, serde_json::Value>, _ctx: &Context) -> StoreResult<usize> {
        Ok(values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Update;

    #[test]
    fn test_writes_are_discarded() {
        let ns = NullNamespace;
        let ctx = Context::new("test");
        ns.set("k", Output::plain("v"), &ctx).unwrap();
        assert!(ns.get("k").unwrap().is_none());
        assert_eq!(ns.len().unwrap(), 0);
    }

    #[test]
    fn test_transaction_sees_nothing() {
        let ns = NullNamespace;
        let ctx = Context::new("test");
        let mut seen = None;
        let result = ns
            .update_transaction(
                "k",
                &mut |entry| {
                    seen = Some(entry.is_none());
                    Ok(Update::Write(Output::plain("v")))
                },
                &ctx,
            )
            .unwrap();
        assert_eq!(seen, Some(true));
        assert!(result.is_none());
    }
}
