use crate::config::RuntimeConfig;
use crate::executor::FlowRun;
use crate::hooks::FlowHook;
use crate::loader;
use chrono::{DateTime, Utc};
use flowcore::{
    status, tags, CompleteFlow, Context, EventBus, ExecutionEvent, FlowDesc, FlowError,
    FunctionArguments, OperationDesc, Operator, Output,
};
use flowstore::FlowRepository;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::Instrument;

/// Counters of an engine since it was created
pub(crate) struct Metrics {
    flow_executions: AtomicU64,
    operation_executions: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Metrics {
    fn new() -> Self {
        Self {
            flow_executions: AtomicU64::new(0),
            operation_executions: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub(crate) fn count_flow(&self) {
        self.flow_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_operation(&self) {
        self.operation_executions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of the engine counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub flow_executions: u64,
    pub operation_executions: u64,
    pub started_at: DateTime<Utc>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Holds all operators, flows and hooks and executes flows.
///
/// Each registry has its own short-held lock; no lock is held while a flow
/// or a hook runs.
pub struct FlowEngine {
    operators: RwLock<BTreeMap<String, Arc<dyn Operator>>>,
    flows: RwLock<BTreeMap<String, FlowDesc>>,
    hooks: RwLock<BTreeMap<String, Arc<dyn FlowHook>>>,
    repository: Option<Arc<dyn FlowRepository>>,
    events: Arc<EventBus>,
    pub(crate) metrics: Metrics,
    config: RuntimeConfig,
}

impl FlowEngine {
    pub fn new(config: RuntimeConfig) -> Self {
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            operators: RwLock::new(BTreeMap::new()),
            flows: RwLock::new(BTreeMap::new()),
            hooks: RwLock::new(BTreeMap::new()),
            repository: None,
            events,
            metrics: Metrics::new(),
            config,
        }
    }

    /// Flows added at runtime are written to `repository` when the config
    /// asks for persistence
    pub fn with_repository(mut self, repository: Arc<dyn FlowRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            flow_executions: self.metrics.flow_executions.load(Ordering::Relaxed),
            operation_executions: self.metrics.operation_executions.load(Ordering::Relaxed),
            started_at: self.metrics.started_at,
        }
    }

    // Operators

    pub fn add_operator(&self, operator: Arc<dyn Operator>) {
        let name = operator.name().to_string();
        tracing::info!("Registering operator: {}", name);
        write(&self.operators).insert(name.to_lowercase(), operator);
    }

    pub fn has_operator(&self, name: &str) -> bool {
        read(&self.operators).contains_key(&name.to_lowercase())
    }

    pub fn operator(&self, name: &str) -> Option<Arc<dyn Operator>> {
        read(&self.operators).get(&name.to_lowercase()).cloned()
    }

    /// Display names of all operators
    pub fn operator_names(&self) -> Vec<String> {
        read(&self.operators)
            .values()
            .map(|op| op.name().to_string())
            .collect()
    }

    fn operators_snapshot(&self) -> Vec<Arc<dyn Operator>> {
        read(&self.operators).values().cloned().collect()
    }

    // Hooks

    pub fn add_hook(&self, hook: Arc<dyn FlowHook>) {
        let name = hook.name().to_string();
        tracing::debug!("Registering hook: {}", name);
        write(&self.hooks).insert(name, hook);
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn FlowHook>> {
        read(&self.hooks).values().cloned().collect()
    }

    async fn trigger_execute_hooks(&self, ctx: &Context, flow_id: &str, args: &FunctionArguments, input: &Output) {
        for hook in self.hooks_snapshot() {
            if let Err(e) = hook.on_execute(ctx, flow_id, args, input).await {
                tracing::warn!(context = %ctx.id(), "Execution of hook \"{}\" failed: {}", hook.name(), e);
            }
        }
    }

    async fn trigger_finished_hooks(
        &self,
        ctx: &Context,
        flow_id: &str,
        args: &FunctionArguments,
        input: &Output,
        result: &Output,
    ) {
        for hook in self.hooks_snapshot() {
            if let Err(e) = hook
                .on_execution_finished(ctx, flow_id, args, input, result)
                .await
            {
                tracing::warn!(context = %ctx.id(), "Execution of finished hook \"{}\" failed: {}", hook.name(), e);
            }
        }
    }

    pub(crate) async fn trigger_operation_hooks(
        &self,
        ctx: &Context,
        flow_id: &str,
        operation: &OperationDesc,
        input: &Output,
        output: &Output,
    ) {
        for hook in self.hooks_snapshot() {
            if let Err(e) = hook
                .on_execute_operation(ctx, flow_id, operation, input, output)
                .await
            {
                tracing::warn!(context = %ctx.id(), "Execution of operation hook \"{}\" failed: {}", hook.name(), e);
            }
        }
    }

    async fn trigger_flow_changed(&self, ctx: &Context, added: Vec<String>, removed: Vec<String>) {
        for hook in self.hooks_snapshot() {
            if let Err(e) = hook.on_flow_changed(ctx, &added, &removed).await {
                tracing::warn!(context = %ctx.id(), "Execution of flow changed hook \"{}\" failed: {}", hook.name(), e);
            }
        }
        self.events.emit(ExecutionEvent::FlowsChanged {
            added,
            removed,
            timestamp: Utc::now(),
        });
    }

    // Flows

    /// Validates and stores a flow. Fails with "already exists" unless
    /// `overwrite` is set.
    pub async fn add_flow(&self, ctx: &Context, id: &str, desc: FlowDesc, overwrite: bool) -> Result<(), FlowError> {
        let persist = self.config.persist_flows && self.repository.is_some();
        self.insert_flow(id, desc, overwrite, persist)?;
        self.trigger_flow_changed(ctx, vec![id.to_string()], Vec::new()).await;
        Ok(())
    }

    fn insert_flow(&self, id: &str, mut desc: FlowDesc, overwrite: bool, persist: bool) -> Result<(), FlowError> {
        desc.validate(id, |name| self.has_operator(name))?;

        let mut flows = write(&self.flows);
        if let Some(old) = flows.get(id) {
            if !overwrite {
                return Err(FlowError::FlowExists(id.to_string()));
            }
            tracing::warn!(
                "Flow \"{}\" already exists (source {:?}), overwriting with source {:?}",
                id,
                old.source,
                desc.source
            );
        }
        if persist {
            if let Some(repository) = &self.repository {
                repository.save(id, &desc)?;
                desc.source.get_or_insert_with(|| "store".to_string());
            }
        }
        flows.insert(id.to_string(), desc);
        Ok(())
    }

    /// Removes a flow from the engine and from the repository
    pub async fn delete_flow(&self, ctx: &Context, id: &str) -> Result<FlowDesc, FlowError> {
        let removed = write(&self.flows)
            .remove(id)
            .ok_or_else(|| FlowError::FlowNotFound(id.to_string()))?;
        if let Some(repository) = &self.repository {
            repository.delete(id)?;
        }
        self.trigger_flow_changed(ctx, Vec::new(), vec![id.to_string()]).await;
        Ok(removed)
    }

    pub fn flow_desc(&self, id: &str) -> Option<FlowDesc> {
        read(&self.flows).get(id).cloned()
    }

    pub fn complete_flow_desc(&self, id: &str) -> Result<CompleteFlow, FlowError> {
        let desc = self
            .flow_desc(id)
            .ok_or_else(|| FlowError::FlowNotFound(id.to_string()))?;
        Ok(desc.validate(id, |name| self.has_operator(name))?)
    }

    pub fn all_flows(&self) -> BTreeMap<String, FlowDesc> {
        read(&self.flows).clone()
    }

    pub fn flow_ids(&self) -> Vec<String> {
        read(&self.flows).keys().cloned().collect()
    }

    /// Flows carrying every one of `wanted`
    pub fn flows_by_tags<W: AsRef<str>>(&self, wanted: &[W]) -> BTreeMap<String, FlowDesc> {
        read(&self.flows)
            .iter()
            .filter(|(_, desc)| desc.has_all_tags(wanted))
            .map(|(id, desc)| (id.clone(), desc.clone()))
            .collect()
    }

    /// Flows carrying at least one tag of every group
    pub fn flows_by_tag_groups<W: AsRef<str>>(&self, groups: &[Vec<W>]) -> BTreeMap<String, FlowDesc> {
        read(&self.flows)
            .iter()
            .filter(|(_, desc)| desc.has_at_least_one_tag_per_group(groups))
            .map(|(id, desc)| (id.clone(), desc.clone()))
            .collect()
    }

    /// Every tag used by any flow
    pub fn tags(&self) -> BTreeSet<String> {
        read(&self.flows)
            .values()
            .flat_map(|desc| desc.tags.iter().cloned())
            .collect()
    }

    /// Tag keys with their distinct values, sorted
    pub fn tag_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for desc in read(&self.flows).values() {
            for tag in &desc.tags {
                let (key, value) = tags::split_tag(tag);
                if key.is_empty() {
                    continue;
                }
                let values = map.entry(key.to_string()).or_default();
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    values.insert(value.to_string());
                }
            }
        }
        map.into_iter()
            .map(|(key, values)| (key, values.into_iter().collect()))
            .collect()
    }

    /// Distinct values of the tag `key` among the flows that also carry all
    /// of `other_tags`
    pub fn tag_values<W: AsRef<str>>(&self, key: &str, other_tags: &[W]) -> Vec<String> {
        if key.is_empty() {
            return Vec::new();
        }
        let mut wanted: Vec<&str> = vec![key];
        wanted.extend(other_tags.iter().map(AsRef::as_ref));
        let values: BTreeSet<String> = self
            .flows_by_tags(&wanted)
            .values()
            .flat_map(|desc| desc.tags.clone())
            .filter_map(|tag| match tags::split_tag(&tag) {
                (k, Some(v)) if k.eq_ignore_ascii_case(key) && !v.is_empty() => Some(v.to_string()),
                _ => None,
            })
            .collect();
        values.into_iter().collect()
    }

    /// Adds the flows kept in the repository. Invalid flows are skipped
    /// with a warning; returns how many were added.
    pub async fn load_persisted_flows(&self, ctx: &Context) -> Result<usize, FlowError> {
        let Some(repository) = &self.repository else {
            return Ok(0);
        };
        let mut added = Vec::new();
        for (id, mut desc) in repository.load_all()? {
            desc.source.get_or_insert_with(|| "store".to_string());
            match self.insert_flow(&id, desc, true, false) {
                Ok(()) => added.push(id),
                Err(e) => tracing::warn!("Skipping stored flow \"{}\": {}", id, e),
            }
        }
        let count = added.len();
        tracing::info!("Loaded {} flows from the store", count);
        if count > 0 {
            self.trigger_flow_changed(ctx, added, Vec::new()).await;
        }
        Ok(count)
    }

    /// Adds the flows of files or directories without persisting them.
    /// Invalid flows are skipped with a warning; returns how many were
    /// added.
    pub async fn load_flows_from(&self, ctx: &Context, paths: &[PathBuf]) -> Result<usize, FlowError> {
        let mut added = Vec::new();
        for path in paths {
            for (id, desc) in loader::read_flows(path)? {
                match self.insert_flow(&id, desc, true, false) {
                    Ok(()) => added.push(id),
                    Err(e) => tracing::warn!("Skipping flow \"{}\" from {}: {}", id, path.display(), e),
                }
            }
        }
        let count = added.len();
        if count > 0 {
            self.trigger_flow_changed(ctx, added, Vec::new()).await;
        }
        Ok(count)
    }

    // Lifecycle

    pub async fn start_listening(&self, ctx: &Context) {
        for operator in self.operators_snapshot() {
            operator.start_listening(ctx).await;
        }
        self.trigger_flow_changed(ctx, Vec::new(), Vec::new()).await;
    }

    pub async fn shutdown(&self, ctx: &Context) {
        for operator in self.operators_snapshot() {
            tracing::debug!("Stopping {}", operator.name());
            operator.shutdown(ctx).await;
        }
    }

    // Execution

    /// Executes a stored flow
    pub async fn execute_flow(&self, ctx: &Context, id: &str, args: FunctionArguments, input: Output) -> Output {
        let Some(desc) = self.flow_desc(id) else {
            return FlowError::FlowNotFound(id.to_string()).into();
        };
        self.execute_adhoc_flow(ctx, id, desc, args, input).await
    }

    /// Validates and executes a flow that is not stored in the engine
    pub async fn execute_adhoc_flow(
        &self,
        ctx: &Context,
        id: &str,
        desc: FlowDesc,
        args: FunctionArguments,
        input: Output,
    ) -> Output {
        let flow = match desc.validate(id, |name| self.has_operator(name)) {
            Ok(flow) => flow,
            Err(e) => {
                tracing::warn!(context = %ctx.id(), "Flow \"{}\" is invalid: {}", id, e);
                return e.into();
            }
        };

        self.trigger_execute_hooks(ctx, id, &args, &input).await;
        self.events.emit(ExecutionEvent::FlowStarted {
            context_id: ctx.id(),
            flow_id: id.to_string(),
            timestamp: Utc::now(),
        });

        let flow_ctx = ctx.nested(id);
        let started = Instant::now();
        let output = FlowRun::new(self, &flow)
            .execute(&flow_ctx, &args, &input)
            .instrument(flow_ctx.span().clone())
            .await;

        self.events.emit(ExecutionEvent::FlowCompleted {
            context_id: ctx.id(),
            flow_id: id.to_string(),
            status: output.status_code(),
            success: !output.is_error(),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
        self.trigger_finished_hooks(ctx, id, &args, &input, &output).await;
        output
    }

    /// Calls one operator function through a single-operation flow
    pub async fn execute_operator(
        &self,
        ctx: &Context,
        operator: &str,
        function: &str,
        args: FunctionArguments,
        input: Output,
    ) -> Output {
        let id = format!("OnDemand/{}/{}", operator, function);
        let desc = FlowDesc::default().with_operation(OperationDesc::new(operator, function));
        self.execute_adhoc_flow(ctx, &id, desc, args, input).await
    }

    /// Executes every flow carrying all of `tags`
    pub async fn execute_by_tags<W: AsRef<str>>(
        &self,
        ctx: &Context,
        tags: &[W],
        args: FunctionArguments,
        input: Output,
    ) -> Output {
        let groups: Vec<Vec<String>> = tags
            .iter()
            .map(|tag| vec![tag.as_ref().to_string()])
            .collect();
        self.execute_by_tag_groups(ctx, &groups, args, input).await
    }

    /// Executes every flow carrying at least one tag of each group, one
    /// after the other in id order. A single match returns its output,
    /// several return an object of all outputs by flow id.
    pub async fn execute_by_tag_groups(
        &self,
        ctx: &Context,
        groups: &[Vec<String>],
        args: FunctionArguments,
        input: Output,
    ) -> Output {
        if groups.is_empty() {
            return Output::error(status::BAD_REQUEST, "No tags given");
        }
        let matching = self.flow_ids_by_tag_groups(groups);
        match matching.as_slice() {
            [] => Output::error(
                status::NOT_FOUND,
                format!("No flow with tags found: {:?}", groups),
            ),
            [id] => self.execute_flow(ctx, id, args, input).await,
            ids => {
                let dispatch_id = format!("ExecuteFlowByTag/{:?}", groups);
                self.trigger_execute_hooks(ctx, &dispatch_id, &args, &input).await;
                let inner_ctx = ctx.nested(&dispatch_id);
                let mut outputs = BTreeMap::new();
                for id in ids {
                    let output = self
                        .execute_flow(&inner_ctx, id, args.clone(), input.clone())
                        .await;
                    outputs.insert(id.clone(), output);
                }
                let result = Output::object(&outputs);
                self.trigger_finished_hooks(ctx, &dispatch_id, &args, &input, &result)
                    .await;
                result
            }
        }
    }

    fn flow_ids_by_tag_groups(&self, groups: &[Vec<String>]) -> Vec<String> {
        read(&self.flows)
            .iter()
            .filter(|(_, desc)| desc.has_at_least_one_tag_per_group(groups))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Default for FlowEngine {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}
