use flowcore::{
    status, ArgField, ArgumentRecord, Context, DynamicFunctions, FunctionArguments,
    FunctionShape, NoArguments, Operator, OperatorBuilder, OperatorHandler, Output, Suggestions,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Lights {
    level: AtomicI64,
    scenes: Option<Scenes>,
}

struct Scenes;

#[async_trait]
impl DynamicFunctions for Scenes {
    fn dynamic_functions(&self) -> Vec<String> {
        vec!["evening".to_string()]
    }

    fn dynamic_parameters(&self, _function: &str) -> Vec<String> {
        vec!["room".to_string()]
    }

    fn suggest_dynamic_values(&self, _function: &str, _arg: &str, _other: &FunctionArguments) -> Suggestions {
        flowcore::to_suggestions(["kitchen"])
    }

    async fn execute_dynamic(
        &self,
        _ctx: &Context,
        function: &str,
        args: FunctionArguments,
        _input: &Output,
    ) -> Output {
        Output::plain(format!("{} in {}", function, args.get_or("room", "everywhere")))
    }
}

impl OperatorHandler for Lights {
    fn suggest(&self, arg: &str, _other: &FunctionArguments) -> Option<Vec<String>> {
        (arg == "device").then(|| vec!["lamp".to_string(), "spot".to_string()])
    }

    fn dynamic(&self) -> Option<&dyn DynamicFunctions> {
        self.scenes.as_ref().map(|s| s as &dyn DynamicFunctions)
    }
}

#[derive(Default)]
struct DimArgs {
    device: String,
    level: i64,
    fade: Option<Duration>,
    smooth: Option<bool>,
}

impl ArgumentRecord<Lights> for DimArgs {
    fn fields() -> Vec<ArgField<Self>> {
        vec![
            ArgField::string("device", |r: &mut Self, v| r.device = v),
            ArgField::int("level", |r: &mut Self, v| r.level = v),
            ArgField::duration("fadeTime", |r: &mut Self, v| r.fade = Some(v)).optional(),
            ArgField::bool("smooth", |r: &mut Self, v| r.smooth = Some(v)).optional(),
        ]
    }

    fn verify(&self, _op: &Lights) -> Result<(), Output> {
        if self.level > 100 {
            return Err(Output::error(status::BAD_REQUEST, "level must not exceed 100"));
        }
        Ok(())
    }

    fn suggestions(&self, _op: &Lights, arg: &str) -> Option<Vec<String>> {
        match arg {
            "level" if self.device == "spot" => Some(vec!["0".into(), "50".into()]),
            _ => None,
        }
    }
}

impl Lights {
    async fn status(&self) -> Output {
        Output::integer(self.level.load(Ordering::SeqCst))
    }

    async fn whoami(&self, ctx: &Context) -> Output {
        Output::plain(ctx.reason())
    }

    async fn mirror(&self, _ctx: &Context, input: &Output) -> Output {
        input.clone()
    }

    async fn dim(&self, _ctx: &Context, _input: &Output, args: DimArgs) -> Output {
        self.level.store(args.level, Ordering::SeqCst);
        let fade = args.fade.map(|d| d.as_millis()).unwrap_or_default();
        Output::plain(format!("{}={} fade {}ms", args.device, args.level, fade))
    }

    async fn rest(&self, _ctx: &Context, _input: &Output, _args: NoArguments, rest: FunctionArguments) -> Output {
        Output::object(&rest.original_case_map())
    }
}

fn build(lights: Lights, strict: bool) -> impl Operator {
    OperatorBuilder::new("lights", lights)
        .strict(strict)
        .simple("status", |op| Box::pin(op.status()))
        .context_only("whoAmI", |op, ctx| Box::pin(op.whoami(ctx)))
        .context_and_input("mirror", |op, ctx, input| Box::pin(op.mirror(ctx, input)))
        .with_arguments("dim", |op, ctx, input, args: DimArgs| Box::pin(op.dim(ctx, input, args)))
        .full_signature("rest", |op, ctx, input, args: NoArguments, rest| {
            Box::pin(op.rest(ctx, input, args, rest))
        })
        .build()
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_every_shape_is_invokable() {
    init_tracing();
    let op = build(Lights::default(), true);
    let ctx = Context::new("adapter test");

    let args = FunctionArguments::new().with("device", "lamp").with("level", "40");
    let out = op.execute(&ctx, "DIM", args, &Output::empty()).await;
    assert_eq!(out.to_text(), "lamp=40 fade 0ms");

    let out = op.execute(&ctx, "status", FunctionArguments::new(), &Output::empty()).await;
    assert_eq!(out.to_text(), "40");

    let out = op.execute(&ctx, "whoami", FunctionArguments::new(), &Output::empty()).await;
    assert_eq!(out.to_text(), "adapter test");

    let out = op.execute(&ctx, "mirror", FunctionArguments::new(), &Output::plain("hi")).await;
    assert_eq!(out.to_text(), "hi");

    let mut names = op.functions();
    names.sort();
    assert_eq!(names, vec!["dim", "mirror", "rest", "status", "whoAmI"]);
}

#[tokio::test]
async fn test_shapes_are_reported() {
    let op = OperatorBuilder::new("lights", Lights::default())
        .simple("status", |op| Box::pin(op.status()))
        .with_arguments("dim", |op, ctx, input, args: DimArgs| Box::pin(op.dim(ctx, input, args)))
        .build()
        .unwrap()
        .unwrap();
    assert_eq!(op.shape("Status"), Some(FunctionShape::Simple));
    assert_eq!(op.shape("dim"), Some(FunctionShape::WithArguments));
    assert_eq!(op.shape("missing"), None);
}

#[tokio::test]
async fn test_binding_errors_are_bad_requests() {
    let op = build(Lights::default(), true);
    let ctx = Context::new("test");

    let out = op
        .execute(&ctx, "dim", FunctionArguments::new().with("device", "lamp"), &Output::empty())
        .await;
    assert_eq!(out.status_code(), status::BAD_REQUEST);
    assert_eq!(out.to_text(), "required Parameter \"level\" is missing");

    let args = FunctionArguments::new().with("device", "lamp").with("level", "bright");
    let out = op.execute(&ctx, "dim", args, &Output::empty()).await;
    assert_eq!(out.status_code(), status::BAD_REQUEST);
    assert!(out.to_text().starts_with("Parameter \"level\" is invalid"));

    let args = FunctionArguments::new().with("device", "lamp").with("level", "500");
    let out = op.execute(&ctx, "dim", args, &Output::empty()).await;
    assert_eq!(out.to_text(), "level must not exceed 100");
}

#[tokio::test]
async fn test_optional_conversion_failure_depends_on_strictness() {
    let ctx = Context::new("test");
    let args = || {
        FunctionArguments::new()
            .with("device", "lamp")
            .with("level", "10")
            .with("fadeTime", "soon")
    };

    let strict = build(Lights::default(), true);
    let out = strict.execute(&ctx, "dim", args(), &Output::empty()).await;
    assert_eq!(out.status_code(), status::BAD_REQUEST);

    let lenient = build(Lights::default(), false);
    let out = lenient.execute(&ctx, "dim", args(), &Output::empty()).await;
    assert!(!out.is_error());

    let out = lenient
        .execute(
            &ctx,
            "dim",
            FunctionArguments::new().with("device", "lamp").with("level", "10").with("fadetime", "1.5s"),
            &Output::empty(),
        )
        .await;
    assert_eq!(out.to_text(), "lamp=10 fade 1500ms");
}

#[tokio::test]
async fn test_full_signature_receives_only_leftovers() {
    let op = build(Lights::default(), true);
    let args = FunctionArguments::new().with("Color", "red").with("Room", "kitchen");
    let out = op.execute(&Context::new("test"), "rest", args, &Output::empty()).await;
    let map: std::collections::BTreeMap<String, String> = out.parse_json().unwrap();
    assert_eq!(map.get("Color").map(String::as_str), Some("red"));
    assert_eq!(map.len(), 2);
}

#[tokio::test]
async fn test_unknown_function_is_not_found() {
    let op = build(Lights::default(), true);
    let out = op
        .execute(&Context::new("test"), "explode", FunctionArguments::new(), &Output::empty())
        .await;
    assert_eq!(out.status_code(), status::NOT_FOUND);
    assert_eq!(out.to_text(), "Function \"explode\" not found");
}

#[tokio::test]
async fn test_dynamic_functions_follow_static_ones() {
    let lights = Lights {
        scenes: Some(Scenes),
        ..Default::default()
    };
    let op = build(lights, true);
    assert!(op.functions().contains(&"evening".to_string()));
    assert_eq!(op.parameters("evening"), vec!["room"]);

    let out = op
        .execute(
            &Context::new("test"),
            "evening",
            FunctionArguments::new().with("room", "kitchen"),
            &Output::empty(),
        )
        .await;
    assert_eq!(out.to_text(), "evening in kitchen");
}

#[test]
fn test_suggestion_order() {
    let op = build(Lights::default(), true);
    let none = FunctionArguments::new();

    // operator-wide suggestions
    let values = op.suggest_values("dim", "device", &none);
    assert_eq!(values.keys().collect::<Vec<_>>(), vec!["lamp", "spot"]);

    // record suggestions win when co-supplied args select them
    let spot = FunctionArguments::new().with("device", "spot").with("level", "not a number");
    let values = op.suggest_values("dim", "level", &spot);
    assert_eq!(values.len(), 2);

    // kind fallbacks
    assert!(op.suggest_values("dim", "level", &none).contains_key("1000"));
    assert!(op.suggest_values("dim", "fadeTime", &none).contains_key("100ms"));
    assert!(op.suggest_values("dim", "smooth", &none).contains_key("true"));
    assert!(op.suggest_values("status", "anything", &none).is_empty());
    assert!(op.suggest_values("missing", "anything", &none).is_empty());
}

#[test]
fn test_parameters_list_record_fields() {
    let op = build(Lights::default(), true);
    assert_eq!(op.parameters("dim"), vec!["device", "level", "fadeTime", "smooth"]);
    assert!(op.parameters("status").is_empty());
}

#[test]
fn test_invalid_entries_are_skipped() {
    let op = OperatorBuilder::new("lights", Lights::default())
        .simple("status", |op| Box::pin(op.status()))
        .simple("STATUS", |op| Box::pin(op.status()))
        .simple("shutdown", |op| Box::pin(op.status()))
        .simple("deviceSuggestions", |op| Box::pin(op.status()))
        .simple("", |op| Box::pin(op.status()))
        .build()
        .unwrap()
        .unwrap();
    assert_eq!(op.functions(), vec!["status"]);
}

#[test]
fn test_operator_without_functions_is_rejected() {
    let result = OperatorBuilder::new("lights", Lights::default())
        .simple("execute", |op| Box::pin(op.status()))
        .build();
    assert!(matches!(result, Err(flowcore::FlowError::NoFunctions(_))));
}

#[test]
fn test_disabled_operator_is_skipped() {
    let result = OperatorBuilder::new("lights", Lights::default())
        .enabled(false)
        .simple("status", |op| Box::pin(op.status()))
        .build()
        .unwrap();
    assert!(result.is_none());
}
