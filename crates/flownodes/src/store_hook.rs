use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{status, Context, FunctionArguments, OperationDesc, Output};
use flowruntime::{FlowHook, HookError};
use flowstore::{SearchQuery, Store, StoreError, StoreNamespace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn hook_error(e: StoreError) -> HookError {
    HookError::Failed(e.to_string())
}

/// What the execution log keeps about a finished root execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub flow_id: String,
    pub reason: String,
    pub arguments: BTreeMap<String, String>,
    pub status: u16,
    pub success: bool,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

/// An operation that failed during a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedError {
    pub input: Output,
    pub error: String,
    pub flow_name: String,
    pub operation: OperationDesc,
}

/// Error log bounded to roughly `max_len` entries. Entries are keyed by a
/// running counter; the failing input is kept next to it as `<id>-input`.
pub struct CollectedErrors {
    ns: Arc<dyn StoreNamespace>,
    max_len: usize,
    counter: AtomicU64,
}

impl CollectedErrors {
    pub fn new(ns: Arc<dyn StoreNamespace>, max_len: usize) -> Self {
        Self {
            ns,
            max_len,
            counter: AtomicU64::new(0),
        }
    }

    pub fn add(
        &self,
        ctx: &Context,
        flow_name: &str,
        operation: &OperationDesc,
        input: &Output,
        error: &Output,
    ) -> Result<(), StoreError> {
        let collected = CollectedError {
            input: input.clone(),
            error: error.to_text(),
            flow_name: flow_name.to_string(),
            operation: operation.clone(),
        };
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.ns.set(&id.to_string(), Output::object(&collected), ctx)?;
        self.ns.set(&format!("{}-input", id), input.clone(), ctx)?;

        let max_len = self.max_len as u64;
        if self.ns.len()? > self.max_len * 2 && id > max_len {
            let expired = id - max_len;
            self.ns.delete(&expired.to_string())?;
            self.ns.delete(&format!("{}-input", expired))?;
        }
        Ok(())
    }

    /// Errors collected within the last `max_age`, oldest first
    pub fn since(&self, max_age: Duration) -> Result<Vec<CollectedError>, StoreError> {
        self.collected(max_age, None)
    }

    /// Errors of the flow `flow_id` collected within the last `max_age`
    pub fn for_flow(&self, max_age: Duration, flow_id: &str) -> Result<Vec<CollectedError>, StoreError> {
        self.collected(max_age, Some(flow_id))
    }

    fn collected(&self, max_age: Duration, flow_id: Option<&str>) -> Result<Vec<CollectedError>, StoreError> {
        let query = SearchQuery {
            max_age: Some(max_age),
            ..Default::default()
        };
        let mut found = Vec::new();
        for (key, entry) in self.ns.search(&query)? {
            // `<id>-input` entries hold the raw input
            let Ok(id) = key.parse::<u64>() else {
                continue;
            };
            match entry.data().parse_json::<CollectedError>() {
                Ok(error) if flow_id.map_or(true, |f| error.flow_name.eq_ignore_ascii_case(f)) => {
                    found.push((id, error));
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Cannot parse error log entry {}: {}", key, e),
            }
        }
        found.sort_by_key(|(id, _)| *id);
        Ok(found.into_iter().map(|(_, error)| error).collect())
    }
}

/// Writes root executions to the execution log and failed operations to
/// the error log
pub struct StoreHook {
    executions: Arc<dyn StoreNamespace>,
    errors: Arc<CollectedErrors>,
}

impl StoreHook {
    pub fn new(store: &Store) -> Result<Self, StoreError> {
        let config = store.config();
        Ok(Self {
            executions: store.namespace(&config.execution_log)?,
            errors: Arc::new(CollectedErrors::new(
                store.namespace(&config.error_log)?,
                config.max_error_log_size,
            )),
        })
    }

    /// The error log this hook writes, for reading it back
    pub fn errors(&self) -> Arc<CollectedErrors> {
        Arc::clone(&self.errors)
    }
}

#[async_trait]
impl FlowHook for StoreHook {
    fn name(&self) -> &str {
        "store"
    }

    async fn on_execute_operation(
        &self,
        ctx: &Context,
        flow_id: &str,
        operation: &OperationDesc,
        input: &Output,
        output: &Output,
    ) -> Result<(), HookError> {
        // 417 is flow control, not a failure
        if !output.is_error() || output.status_code() == status::EXPECTATION_FAILED {
            return Ok(());
        }
        self.errors
            .add(ctx, flow_id, operation, input, output)
            .map_err(hook_error)
    }

    async fn on_execution_finished(
        &self,
        ctx: &Context,
        flow_id: &str,
        args: &FunctionArguments,
        _input: &Output,
        result: &Output,
    ) -> Result<(), HookError> {
        if !ctx.is_root() {
            return Ok(());
        }
        let summary = ExecutionSummary {
            flow_id: flow_id.to_string(),
            reason: ctx.reason().to_string(),
            arguments: args.original_case_map(),
            status: result.status_code(),
            success: !result.is_error(),
            started: ctx.created(),
            finished: Utc::now(),
        };
        self.executions
            .set(&ctx.id().to_string(), Output::object(&summary), ctx)
            .map(|_| ())
            .map_err(hook_error)
    }
}
