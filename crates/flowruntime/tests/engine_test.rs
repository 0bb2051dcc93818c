use async_trait::async_trait;
use flowcore::{
    status, Context, ExecutionEvent, FlowDesc, FlowError, FunctionArguments, NoArguments,
    OperationDesc, OperatorBuilder, OperatorHandler, Output,
};
use flowruntime::{Dispatcher, FlowEngine, FlowHook, HookError, Job, RuntimeConfig, Target};
use flowstore::{FlowRepository, Store, StoreFlowRepository};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Records every call; `echo` returns the `output` argument or the input
#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
}

impl OperatorHandler for Probe {}

impl Probe {
    async fn echo(&self, _ctx: &Context, input: &Output, _args: NoArguments, rest: FunctionArguments) -> Output {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match rest.get("output") {
            Some(text) => Output::plain(text),
            None => input.clone(),
        }
    }

    async fn args(&self, _ctx: &Context, _input: &Output, _args: NoArguments, rest: FunctionArguments) -> Output {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Output::object(&rest.original_case_map())
    }

    async fn fail(&self) -> Output {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Output::error(status::INTERNAL_SERVER_ERROR, "boom")
    }
}

fn engine() -> Arc<FlowEngine> {
    init_tracing();
    let engine = FlowEngine::new(RuntimeConfig::default());
    engine.add_operator(Arc::new(probe_operator()));
    Arc::new(engine)
}

fn probe_operator() -> flowcore::AdaptedOperator<Probe> {
    OperatorBuilder::new("probe", Probe::default())
        .full_signature("echo", |op, ctx, input, args: NoArguments, rest| {
            Box::pin(op.echo(ctx, input, args, rest))
        })
        .full_signature("args", |op, ctx, input, args: NoArguments, rest| {
            Box::pin(op.args(ctx, input, args, rest))
        })
        .simple("fail", |op| Box::pin(op.fail()))
        .build()
        .unwrap()
        .unwrap()
}

fn echo(name: &str) -> OperationDesc {
    OperationDesc::new("probe", "echo").named(name)
}

#[tokio::test]
async fn test_unknown_flow_is_not_found() {
    let engine = engine();
    let out = engine
        .execute_flow(&Context::new("test"), "missing", FunctionArguments::new(), Output::empty())
        .await;
    assert_eq!(out.status_code(), status::NOT_FOUND);
    assert_eq!(out.to_text(), "No flow with name \"missing\" found");
}

#[tokio::test]
async fn test_flow_with_unknown_operator_is_never_added() {
    let engine = engine();
    let desc = FlowDesc::default().with_operation(OperationDesc::new("nope", "x"));
    let err = engine
        .add_flow(&Context::new("test"), "broken", desc, false)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), status::NOT_FOUND);
    assert!(engine.flow_desc("broken").is_none());
}

#[tokio::test]
async fn test_add_flow_refuses_to_overwrite_unless_asked() {
    let engine = engine();
    let ctx = Context::new("test");
    let desc = FlowDesc::default().with_operation(echo("a"));
    engine.add_flow(&ctx, "f", desc.clone(), false).await.unwrap();
    let err = engine.add_flow(&ctx, "f", desc.clone(), false).await.unwrap_err();
    assert!(matches!(err, FlowError::FlowExists(_)));
    assert!(err.to_string().contains("already exists"));
    engine.add_flow(&ctx, "f", desc, true).await.unwrap();
}

#[tokio::test]
async fn test_outputs_feed_inputs_and_variables() {
    let engine = engine();
    let desc = FlowDesc::default()
        .with_operation(echo("greet").with_argument("output", "{\"room\":\"hall\"}"))
        .with_operation(
            OperationDesc::new("probe", "args")
                .named("collect")
                .with_argument("whole", "${greet}")
                .with_argument("where", "in the ${greet.room}"),
        )
        .output_from("collect");
    let out = engine
        .execute_adhoc_flow(&Context::new("test"), "vars", desc, FunctionArguments::new(), Output::empty())
        .await;
    let args: std::collections::BTreeMap<String, String> = out.parse_json().unwrap();
    assert_eq!(args["where"], "in the hall");
    assert_eq!(args["whole"], "{\"room\":\"hall\"}");
}

#[tokio::test]
async fn test_unknown_variable_is_recorded_as_not_found() {
    let engine = engine();
    let desc = FlowDesc::default()
        .with_operation(echo("a").with_argument("output", "${nothing.here}"));
    let out = engine
        .execute_adhoc_flow(&Context::new("test"), "vars", desc, FunctionArguments::new(), Output::empty())
        .await;
    assert_eq!(out.status_code(), status::NOT_FOUND);
    assert_eq!(out.to_text(), "Output \"nothing\" not found");
}

#[tokio::test]
async fn test_main_arguments_and_arguments_source() {
    let engine = engine();
    let desc = FlowDesc::default()
        .with_operation(echo("source").with_argument("output", "{\"level\":\"7\",\"nested\":{\"a\":1}}"))
        .with_operation(
            OperationDesc::new("probe", "args")
                .named("target")
                .with_argument("level", "1")
                .with_argument("mode", "static")
                .arguments_from("source"),
        )
        .with_operation(
            OperationDesc::new("probe", "args")
                .named("private")
                .use_main_args(false),
        )
        .output_from("target");
    let args = FunctionArguments::new().with("mode", "main").with("extra", "yes");
    let out = engine
        .execute_adhoc_flow(&Context::new("test"), "args", desc.clone(), args.clone(), Output::empty())
        .await;
    let bound: std::collections::BTreeMap<String, String> = out.parse_json().unwrap();
    assert_eq!(bound["mode"], "main");
    assert_eq!(bound["extra"], "yes");
    assert_eq!(bound["level"], "7");
    assert_eq!(bound["nested.a"], "1");

    let out = engine
        .execute_adhoc_flow(&Context::new("test"), "args", desc.output_from("private"), args, Output::empty())
        .await;
    let bound: std::collections::BTreeMap<String, String> = out.parse_json().unwrap();
    assert!(bound.is_empty());
}

#[tokio::test]
async fn test_consumed_error_stops_the_run() {
    let engine = engine();
    let desc = FlowDesc::default()
        .with_operation(OperationDesc::new("probe", "fail").named("broken"))
        .with_operation(echo("after").input_from("broken").with_argument("output", "never"))
        .with_operation(echo("last").with_argument("output", "never either"))
        .output_from("last");
    let out = engine
        .execute_adhoc_flow(&Context::new("test"), "stop", desc, FunctionArguments::new(), Output::empty())
        .await;
    assert_eq!(out.status_code(), status::INTERNAL_SERVER_ERROR);
    assert_eq!(out.to_text(), "boom");
    assert_eq!(engine.metrics().operation_executions, 1);
}

#[tokio::test]
async fn test_fail_and_success_guards() {
    let engine = engine();
    let desc = FlowDesc::default()
        .with_operation(OperationDesc::new("probe", "fail").named("try"))
        .with_operation(
            echo("fallback")
                .on_fail_of("try")
                .with_argument("output", "recovered"),
        )
        .with_operation(echo("happy").on_success_of("try").with_argument("output", "unused"))
        .with_operation(
            echo("report")
                .on_fail_of("fallback")
                .input_from("_")
                .with_argument("output", "fallback failed"),
        )
        .with_operation(
            OperationDesc::new("probe", "args")
                .named("result")
                .with_argument("fallback", "${fallback}")
                .with_argument("happy", "${happy}")
                .with_argument("report", "${report}"),
        )
        .output_from("result");
    let out = engine
        .execute_adhoc_flow(&Context::new("test"), "guards", desc, FunctionArguments::new(), Output::empty())
        .await;
    let result: std::collections::BTreeMap<String, String> = out.parse_json().unwrap();
    assert_eq!(result["fallback"], "recovered");
    assert_eq!(result["happy"], "Operation not executed because \"try\" did not succeed");
    assert_eq!(result["report"], "Operation not executed because \"fallback\" did not fail");
}

#[tokio::test]
async fn test_errored_input_is_resolved_before_guards() {
    let engine = engine();
    let desc = FlowDesc::default()
        .with_operation(OperationDesc::new("probe", "fail").named("broken"))
        .with_operation(
            echo("guarded")
                .input_from("broken")
                .on_success_of("broken")
                .with_argument("output", "never"),
        )
        .with_operation(echo("last").with_argument("output", "never either"))
        .output_from("last");
    let out = engine
        .execute_adhoc_flow(&Context::new("test"), "order", desc, FunctionArguments::new(), Output::empty())
        .await;
    assert_eq!(out.status_code(), status::INTERNAL_SERVER_ERROR);
    assert_eq!(out.to_text(), "boom");
    assert_eq!(engine.metrics().operation_executions, 1);
}

#[tokio::test]
async fn test_execute_operator_uses_on_demand_flow() {
    let engine = engine();
    let mut events = engine.events().subscribe();
    let out = engine
        .execute_operator(
            &Context::new("test"),
            "PROBE",
            "echo",
            FunctionArguments::new(),
            Output::plain("hello"),
        )
        .await;
    assert_eq!(out.to_text(), "hello");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(&seen[0], ExecutionEvent::FlowStarted { flow_id, .. } if flow_id == "OnDemand/PROBE/echo"));
    assert!(matches!(&seen[1], ExecutionEvent::OperationCompleted { status: 200, .. }));
    assert!(matches!(&seen[2], ExecutionEvent::FlowCompleted { success: true, .. }));

    let out = engine
        .execute_operator(&Context::new("test"), "nope", "echo", FunctionArguments::new(), Output::empty())
        .await;
    assert_eq!(out.status_code(), status::NOT_FOUND);
}

#[tokio::test]
async fn test_tag_dispatch() {
    let engine = engine();
    let ctx = Context::new("test");
    let flow = |text: &str, tags: &[&str]| {
        FlowDesc::default()
            .with_tags(tags.iter().copied())
            .with_operation(echo("say").with_argument("output", text))
    };
    engine.add_flow(&ctx, "kitchen", flow("kitchen", &["room:kitchen", "light"]), false).await.unwrap();
    engine.add_flow(&ctx, "hall", flow("hall", &["room:hall", "light"]), false).await.unwrap();
    engine.add_flow(&ctx, "heating", flow("heating", &["room:hall"]), false).await.unwrap();

    let none: Vec<Vec<String>> = Vec::new();
    let out = engine.execute_by_tag_groups(&ctx, &none, FunctionArguments::new(), Output::empty()).await;
    assert_eq!(out.status_code(), status::BAD_REQUEST);
    assert_eq!(out.to_text(), "No tags given");

    let out = engine.execute_by_tags(&ctx, &["garage"], FunctionArguments::new(), Output::empty()).await;
    assert_eq!(out.status_code(), status::NOT_FOUND);

    let out = engine
        .execute_by_tags(&ctx, &["light", "room:kitchen"], FunctionArguments::new(), Output::empty())
        .await;
    assert_eq!(out.to_text(), "kitchen");

    let groups = vec![vec!["room:hall".to_string()], vec!["light".to_string(), "heating".to_string()]];
    let out = engine.execute_by_tag_groups(&ctx, &groups, FunctionArguments::new(), Output::empty()).await;
    assert_eq!(out.to_text(), "hall");

    let groups = vec![vec!["room".to_string()]];
    let out = engine.execute_by_tag_groups(&ctx, &groups, FunctionArguments::new(), Output::empty()).await;
    let json = out.to_json();
    let ids: Vec<&String> = json.as_object().unwrap().keys().collect();
    assert_eq!(ids, vec!["hall", "heating", "kitchen"]);
    assert_eq!(json["kitchen"]["payload"]["value"], "kitchen");
}

#[tokio::test]
async fn test_tag_queries() {
    let engine = engine();
    let ctx = Context::new("test");
    for (id, tags) in [
        ("a", vec!["room:kitchen", "light"]),
        ("b", vec!["room:hall", "light"]),
        ("c", vec!["room:hall", "sensor"]),
    ] {
        let desc = FlowDesc::default().with_tags(tags).with_operation(echo("x"));
        engine.add_flow(&ctx, id, desc, false).await.unwrap();
    }
    assert_eq!(engine.tag_values("room", &["light"]), vec!["hall", "kitchen"]);
    assert_eq!(engine.tag_map()["room"], vec!["hall", "kitchen"]);
    assert!(engine.tag_map()["light"].is_empty());
    assert_eq!(engine.flows_by_tags(&["room:hall"]).len(), 2);
    assert!(engine.tags().contains("sensor"));
}

#[derive(Default)]
struct Recorder {
    finished: Mutex<Vec<(String, bool, u16)>>,
    operations: Mutex<Vec<String>>,
    changes: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

#[async_trait]
impl FlowHook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_execute_operation(
        &self,
        _ctx: &Context,
        _flow_id: &str,
        operation: &OperationDesc,
        _input: &Output,
        _output: &Output,
    ) -> Result<(), HookError> {
        self.operations.lock().unwrap().push(operation.name.clone());
        Err(HookError::Failed("hooks never break flows".to_string()))
    }

    async fn on_execution_finished(
        &self,
        ctx: &Context,
        flow_id: &str,
        _args: &FunctionArguments,
        _input: &Output,
        result: &Output,
    ) -> Result<(), HookError> {
        self.finished
            .lock()
            .unwrap()
            .push((flow_id.to_string(), ctx.is_root(), result.status_code()));
        Ok(())
    }

    async fn on_flow_changed(&self, _ctx: &Context, added: &[String], removed: &[String]) -> Result<(), HookError> {
        self.changes.lock().unwrap().push((added.to_vec(), removed.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn test_hooks_observe_executions() {
    let engine = engine();
    let recorder = Arc::new(Recorder::default());
    engine.add_hook(recorder.clone());
    let ctx = Context::new("test");

    let desc = FlowDesc::default()
        .with_operation(echo("one"))
        .with_operation(echo("two"))
        .output_from("two");
    engine.add_flow(&ctx, "pair", desc, false).await.unwrap();
    let out = engine
        .execute_flow(&ctx, "pair", FunctionArguments::new(), Output::plain("in"))
        .await;
    assert!(!out.is_error());
    engine.delete_flow(&ctx, "pair").await.unwrap();

    assert_eq!(*recorder.operations.lock().unwrap(), vec!["one", "two"]);
    assert_eq!(
        *recorder.finished.lock().unwrap(),
        vec![("pair".to_string(), true, status::OK)]
    );
    assert_eq!(
        *recorder.changes.lock().unwrap(),
        vec![
            (vec!["pair".to_string()], Vec::new()),
            (Vec::new(), vec!["pair".to_string()]),
        ]
    );
}

#[tokio::test]
async fn test_flows_are_persisted_and_reloaded() {
    init_tracing();
    let store = Store::in_memory();
    let repository: Arc<dyn FlowRepository> = Arc::new(StoreFlowRepository::from_store(&store).unwrap());
    let ctx = Context::new("test");

    let engine = FlowEngine::new(RuntimeConfig::default()).with_repository(Arc::clone(&repository));
    engine.add_operator(Arc::new(probe_operator()));
    let desc = FlowDesc::new("Saved").with_operation(echo("a"));
    engine.add_flow(&ctx, "saved", desc.clone(), false).await.unwrap();
    assert_eq!(repository.load_all().unwrap(), vec![("saved".to_string(), desc)]);

    let reloaded = FlowEngine::new(RuntimeConfig::default()).with_repository(Arc::clone(&repository));
    reloaded.add_operator(Arc::new(probe_operator()));
    assert_eq!(reloaded.load_persisted_flows(&ctx).await.unwrap(), 1);
    assert_eq!(reloaded.flow_desc("saved").unwrap().display_name, "Saved");

    reloaded.delete_flow(&ctx, "saved").await.unwrap();
    assert!(repository.load_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_flows_load_from_files_without_persisting() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("doorbell.json"),
        r#"{"tags":["button"],"operations":[{"operator":"probe","function":"echo","arguments":{"output":"ding"}}]}"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("bad.json"),
        r#"{"broken":{"operations":[{"operator":"missing","function":"x"}]}}"#,
    )
    .unwrap();

    let ctx = Context::new("test");
    let added = engine
        .load_flows_from(&ctx, &[dir.path().to_path_buf()])
        .await
        .unwrap();
    assert_eq!(added, 1);
    let out = engine
        .execute_flow(&ctx, "doorbell", FunctionArguments::new(), Output::empty())
        .await;
    assert_eq!(out.to_text(), "ding");
}

#[tokio::test]
async fn test_dispatcher_drains_queue_on_shutdown() {
    let engine = engine();
    let ctx = Context::new("test");
    let desc = FlowDesc::default().with_operation(echo("say").with_argument("output", "queued"));
    engine.add_flow(&ctx, "queued", desc, false).await.unwrap();
    let mut events = engine.events().subscribe();

    let dispatcher = Dispatcher::start(Arc::clone(&engine), 2, 16, CancellationToken::new());
    for _ in 0..5 {
        dispatcher
            .submit(Job::new(Context::new("dispatch"), Target::Flow("queued".to_string())))
            .unwrap();
    }
    dispatcher
        .submit(
            Job::new(
                Context::new("dispatch"),
                Target::Operator {
                    operator: "probe".to_string(),
                    function: "echo".to_string(),
                },
            )
            .with_input(Output::plain("direct")),
        )
        .unwrap();
    dispatcher.shutdown().await;

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::FlowCompleted { success, .. } = event {
            assert!(success);
            completed += 1;
        }
    }
    assert_eq!(completed, 6);
    let metrics = engine.metrics();
    assert_eq!(metrics.flow_executions, 6);
    assert_eq!(metrics.operation_executions, 6);
}

#[tokio::test]
async fn test_cancelled_dispatcher_rejects_jobs() {
    let engine = engine();
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(engine, 1, 1, cancel.clone());
    cancel.cancel();
    let err = dispatcher
        .submit(Job::new(Context::new("late"), Target::Flow("any".to_string())))
        .unwrap_err();
    assert_eq!(err.status_code(), status::SERVICE_UNAVAILABLE);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_dispatcher_from_config_accepts_and_runs_jobs() {
    init_tracing();
    let config = RuntimeConfig {
        workers: 1,
        queue_capacity: 4,
        ..RuntimeConfig::default()
    };
    let engine = FlowEngine::new(config);
    engine.add_operator(Arc::new(probe_operator()));
    let engine = Arc::new(engine);
    let mut events = engine.events().subscribe();

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::from_config(Arc::clone(&engine), cancel.clone());
    let ctx = Context::new("queued call");
    let expected_id = ctx.id().to_string();
    let accepted = dispatcher.accept(Job::new(
        ctx,
        Target::Operator {
            operator: "probe".to_string(),
            function: "echo".to_string(),
        },
    ));
    assert_eq!(accepted.status_code(), status::ACCEPTED);
    assert!(!accepted.is_error());
    assert_eq!(accepted.to_json()["requestId"], expected_id.as_str());
    dispatcher.shutdown().await;

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::FlowCompleted { context_id, .. } = event {
            assert_eq!(context_id.to_string(), expected_id);
            completed += 1;
        }
    }
    assert_eq!(completed, 1);

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::from_config(engine, cancel.clone());
    cancel.cancel();
    let refused = dispatcher.accept(Job::new(Context::new("late"), Target::Flow("any".to_string())));
    assert_eq!(refused.status_code(), status::SERVICE_UNAVAILABLE);
    dispatcher.shutdown().await;
}
