use flowcore::{
    status, AdaptedOperator, ArgField, ArgumentRecord, Context, FlowError, FunctionArguments,
    NoArguments, OperatorBuilder, OperatorHandler, Output,
};
use crate::store_hook::CollectedErrors;
use chrono::Utc;
use flowruntime::FlowEngine;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(60 * 60);
const STAT_TYPES: [&str; 3] = ["uptime", "loadavg", "memory"];

/// Introspection and lifecycle of the hub itself
pub struct System {
    engine: Weak<FlowEngine>,
    errors: Arc<CollectedErrors>,
    cancel: CancellationToken,
}

impl OperatorHandler for System {}

#[derive(Default)]
struct FlowNameArgs {
    name: String,
}

impl ArgumentRecord<System> for FlowNameArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![ArgField::string("name", |r: &mut Self, v| r.name = v)]
    }

    fn suggestions(&self, op: &System, arg: &str) -> Option<Vec<String>> {
        match arg {
            "name" => op.engine.upgrade().map(|engine| engine.flow_ids()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct TagArgs {
    tags: Option<String>,
    tag: Option<String>,
}

impl TagArgs {
    fn wanted(&self) -> Vec<String> {
        let mut wanted: Vec<String> = self
            .tags
            .iter()
            .flat_map(|tags| tags.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        if let Some(tag) = self.tag.as_deref().filter(|t| !t.is_empty()) {
            wanted.push(tag.to_string());
        }
        wanted
    }
}

impl ArgumentRecord<System> for TagArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("tags", |r: &mut Self, v| r.tags = Some(v)).optional(),
            ArgField::string("tag", |r: &mut Self, v| r.tag = Some(v)).optional(),
        ]
    }

    fn suggestions(&self, op: &System, arg: &str) -> Option<Vec<String>> {
        match arg {
            "tag" | "tags" => op
                .engine
                .upgrade()
                .map(|engine| engine.tags().into_iter().collect()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct CollectedErrorArgs {
    duration: Option<Duration>,
    flow_id: Option<String>,
}

impl ArgumentRecord<System> for CollectedErrorArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::duration("duration", |r: &mut Self, v| r.duration = Some(v)).optional(),
            ArgField::string("flowId", |r: &mut Self, v| r.flow_id = Some(v)).optional(),
        ]
    }

    fn suggestions(&self, op: &System, arg: &str) -> Option<Vec<String>> {
        match arg {
            "flowId" => op.engine.upgrade().map(|engine| engine.flow_ids()),
            "duration" => Some(vec!["5m".to_string(), "1h".to_string(), "24h".to_string()]),
            _ => None,
        }
    }
}

#[derive(Default)]
struct StatArgs {
    stat_type: String,
}

impl ArgumentRecord<System> for StatArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![ArgField::string("statType", |r: &mut Self, v| r.stat_type = v)]
    }

    fn suggestions(&self, _op: &System, arg: &str) -> Option<Vec<String>> {
        match arg {
            "statType" => Some(STAT_TYPES.iter().map(|t| t.to_string()).collect()),
            _ => None,
        }
    }
}

/// Reads a file below /proc; 501 where there is none
fn read_proc(path: &str) -> Result<String, Output> {
    std::fs::read_to_string(path).map_err(|e| {
        tracing::debug!("Cannot read {}: {}", path, e);
        Output::error(status::NOT_IMPLEMENTED, "Stats only available on Linux")
    })
}

fn load_average() -> Result<Output, Output> {
    let text = read_proc("/proc/loadavg")?;
    let loads: Vec<f64> = text
        .split_whitespace()
        .take(3)
        .filter_map(|v| v.parse().ok())
        .collect();
    let [one, five, fifteen] = loads.as_slice() else {
        return Err(Output::error(status::INTERNAL_SERVER_ERROR, "Unexpected /proc/loadavg format"));
    };
    Ok(Output::json(serde_json::json!({
        "loadavg1": one,
        "loadavg5": five,
        "loadavg15": fifteen,
    })))
}

/// Fields of /proc/meminfo in bytes
fn memory() -> Result<Output, Output> {
    let text = read_proc("/proc/meminfo")?;
    let fields: BTreeMap<String, u64> = text
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
            let name = match name {
                "MemTotal" => "total",
                "MemFree" => "free",
                "MemAvailable" => "available",
                "Cached" => "cached",
                "SwapTotal" => "swapTotal",
                "SwapFree" => "swapFree",
                _ => return None,
            };
            Some((name.to_string(), kib * 1024))
        })
        .collect();
    Ok(Output::object(&fields))
}

impl System {
    fn engine(&self) -> Result<Arc<FlowEngine>, Output> {
        self.engine
            .upgrade()
            .ok_or_else(|| Output::error(status::SERVICE_UNAVAILABLE, "Flow engine is not running"))
    }

    async fn noop(&self) -> Output {
        Output::empty()
    }

    async fn fail(&self) -> Output {
        Output::error(status::EXPECTATION_FAILED, "Fail requested")
    }

    async fn echo(&self, input: &Output, rest: FunctionArguments) -> Output {
        match rest.get("output") {
            Some(output) => Output::plain(output),
            None => input.clone(),
        }
    }

    async fn version(&self) -> Output {
        Output::plain(concat!("flowhub ", env!("CARGO_PKG_VERSION")))
    }

    async fn metrics(&self) -> Output {
        match self.engine() {
            Ok(engine) => Output::object(&engine.metrics()),
            Err(e) => e,
        }
    }

    async fn get_flow_desc(&self, args: FlowNameArgs) -> Output {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return e,
        };
        match engine.complete_flow_desc(&args.name) {
            Ok(flow) => Output::object(&flow),
            Err(e) => e.into(),
        }
    }

    async fn get_flow_desc_by_tag(&self, args: TagArgs) -> Output {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return e,
        };
        let wanted = args.wanted();
        let flows = engine.flows_by_tags(&wanted);
        if flows.is_empty() {
            return Output::error(
                status::NOT_FOUND,
                format!("No flows with tags {}", wanted.join(",")),
            );
        }
        Output::object(&flows)
    }

    async fn delete_flow(&self, ctx: &Context, args: FlowNameArgs) -> Output {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return e,
        };
        match engine.delete_flow(ctx, &args.name).await {
            Ok(desc) => Output::object(&desc),
            Err(e) => e.into(),
        }
    }

    async fn get_tags(&self) -> Output {
        match self.engine() {
            Ok(engine) => Output::object(&engine.tag_map()),
            Err(e) => e,
        }
    }

    async fn get_operators(&self) -> Output {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return e,
        };
        let operators: BTreeMap<String, Vec<String>> = engine
            .operator_names()
            .into_iter()
            .filter_map(|name| {
                let functions = engine.operator(&name)?.functions();
                Some((name, functions))
            })
            .collect();
        Output::object(&operators)
    }

    async fn get_collected_errors(&self, args: CollectedErrorArgs) -> Output {
        let window = args.duration.unwrap_or(DEFAULT_ERROR_WINDOW);
        let errors = match args.flow_id.as_deref().filter(|f| !f.is_empty()) {
            Some(flow_id) => self.errors.for_flow(window, flow_id),
            None => self.errors.since(window),
        };
        match errors {
            Ok(errors) => Output::object(&errors),
            Err(e) => e.into(),
        }
    }

    async fn stats(&self, args: StatArgs) -> Output {
        let stats = match args.stat_type.as_str() {
            "uptime" => self.engine().map(|engine| {
                let started = engine.metrics().started_at;
                let uptime = (Utc::now() - started).num_seconds().max(0);
                Output::json(serde_json::json!({
                    "startedAt": started,
                    "uptimeSeconds": uptime,
                }))
            }),
            "loadavg" => load_average(),
            "memory" => memory(),
            other => Err(Output::error(
                status::BAD_REQUEST,
                format!("Unknown statType \"{}\", expected one of {}", other, STAT_TYPES.join(", ")),
            )),
        };
        stats.unwrap_or_else(|e| e)
    }

    /// Reads the stored flows and the configured flow files again
    async fn reload(&self, ctx: &Context) -> Output {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return e,
        };
        let stored = match engine.load_persisted_flows(ctx).await {
            Ok(count) => count,
            Err(e) => return e.into(),
        };
        let flow_dirs = engine.config().flow_dirs.clone();
        let from_files = match engine.load_flows_from(ctx, &flow_dirs).await {
            Ok(count) => count,
            Err(e) => return e.into(),
        };
        tracing::info!(context = %ctx.id(), "Reloaded {} stored flows and {} flows from files", stored, from_files);
        Output::json(serde_json::json!({
            "stored": stored,
            "files": from_files,
        }))
    }

    async fn stop(&self, ctx: &Context) -> Output {
        tracing::info!(context = %ctx.id(), "Shutdown requested: {}", ctx.reason());
        self.cancel.cancel();
        Output::empty()
    }
}

/// `stop` cancels `cancel`; the binary owning the token
/// decides what that means for the process. `getCollectedErrors` reads
/// `errors`.
pub fn operator(
    engine: Weak<FlowEngine>,
    errors: Arc<CollectedErrors>,
    cancel: CancellationToken,
    enabled: bool,
) -> Result<Option<AdaptedOperator<System>>, FlowError> {
    OperatorBuilder::new(
        "system",
        System {
            engine,
            errors,
            cancel,
        },
    )
        .enabled(enabled)
        .simple("noop", |op| Box::pin(op.noop()))
        .simple("fail", |op| Box::pin(op.fail()))
        .full_signature("echo", |op, _ctx, input, _args: NoArguments, rest| {
            Box::pin(op.echo(input, rest))
        })
        .simple("version", |op| Box::pin(op.version()))
        .simple("metrics", |op| Box::pin(op.metrics()))
        .with_arguments("getFlowDesc", |op, _ctx, _input, args: FlowNameArgs| {
            Box::pin(op.get_flow_desc(args))
        })
        .with_arguments("getFlowDescByTag", |op, _ctx, _input, args: TagArgs| {
            Box::pin(op.get_flow_desc_by_tag(args))
        })
        .with_arguments("deleteFlow", |op, ctx, _input, args: FlowNameArgs| {
            Box::pin(op.delete_flow(ctx, args))
        })
        .simple("getTags", |op| Box::pin(op.get_tags()))
        .simple("getOperators", |op| Box::pin(op.get_operators()))
        .with_arguments("getCollectedErrors", |op, _ctx, _input, args: CollectedErrorArgs| {
            Box::pin(op.get_collected_errors(args))
        })
        .with_arguments("stats", |op, _ctx, _input, args: StatArgs| Box::pin(op.stats(args)))
        .context_only("reload", |op, ctx| Box::pin(op.reload(ctx)))
        .context_only("stop", |op, ctx| Box::pin(op.stop(ctx)))
        .build()
}
