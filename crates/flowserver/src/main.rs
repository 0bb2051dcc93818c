mod request;

use actix_cors::Cors;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::http::StatusCode;
use actix_web::{get, web, App, HttpRequest, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use anyhow::Context as _;
use clap::Parser;
use flowcore::{status, Context, FunctionArguments, Output};
use flowruntime::{Dispatcher, FlowEngine, HubConfig, Job, JobQueue, Target};
use flowstore::{Store, StoreFlowRepository};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const REQUEST_ID_HEADER: &str = "X-Flow-Request-Id";

#[derive(Parser)]
#[command(name = "flowserver", about = "Flow hub HTTP server", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(short, long, env = "FLOWHUB_CONFIG")]
    config: Option<PathBuf>,
}

/// Application state shared across handlers
struct AppState {
    engine: Arc<FlowEngine>,
    jobs: JobQueue,
    timeout: Duration,
}

fn respond(ctx: &Context, output: &Output) -> HttpResponse {
    let code = StatusCode::from_u16(output.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(code)
        .insert_header((REQUEST_ID_HEADER, ctx.id().to_string()))
        .content_type(output.content_type())
        .body(output.to_bytes())
}

fn request_context(req: &HttpRequest) -> Context {
    Context::new(format!("HTTP {} {}", req.method(), req.path()))
}

/// Query arguments and main input of an operator call
fn call_arguments(
    req: &HttpRequest,
    body: &[u8],
    device: Option<String>,
) -> Result<(FunctionArguments, Output), Output> {
    let mut args = request::query_arguments(req.query_string())?;
    if let Some(device) = device {
        args.set("device", device);
    }
    let content_type = req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let input = request::body_input(content_type, body)?;
    Ok((args, input))
}

/// Runs one operator function for a request. The execution task keeps
/// running when the request times out.
async fn execute(
    req: HttpRequest,
    body: web::Bytes,
    data: web::Data<AppState>,
    operator: String,
    function: String,
    device: Option<String>,
) -> HttpResponse {
    let ctx = request_context(&req);
    let (args, input) = match call_arguments(&req, &body, device) {
        Ok(call) => call,
        Err(e) => return respond(&ctx, &e),
    };

    let engine = Arc::clone(&data.engine);
    let task_ctx = ctx.clone();
    let task = actix_web::rt::spawn(async move {
        engine
            .execute_operator(&task_ctx, &operator, &function, args, input)
            .await
    });

    let output = match tokio::time::timeout(data.timeout, task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            error!(context = %ctx.id(), "Execution task failed: {}", e);
            Output::error(status::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(_) => {
            warn!(context = %ctx.id(), "Request timed out after {:?}", data.timeout);
            Output::error(
                status::SERVICE_UNAVAILABLE,
                "processing timeout - flow might still be running",
            )
        }
    };
    if output.is_error() {
        info!(context = %ctx.id(), "{} {} failed: {}", req.method(), req.path(), output);
    }
    respond(&ctx, &output)
}

async fn call_function(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    body: web::Bytes,
    data: web::Data<AppState>,
) -> HttpResponse {
    let (operator, function) = path.into_inner();
    execute(req, body, data, operator, function, None).await
}

/// Legacy form with the device as last path segment
async fn call_device_function(
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
    body: web::Bytes,
    data: web::Data<AppState>,
) -> HttpResponse {
    let (operator, function, device) = path.into_inner();
    execute(req, body, data, operator, function, Some(device)).await
}

/// Queues an operator call on the dispatcher and answers 202 at once
async fn queue_function(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    body: web::Bytes,
    data: web::Data<AppState>,
) -> HttpResponse {
    let (operator, function) = path.into_inner();
    let ctx = request_context(&req);
    let output = match call_arguments(&req, &body, None) {
        Ok((args, input)) => data.jobs.accept(
            Job::new(ctx.clone(), Target::Operator { operator, function })
                .with_args(args)
                .with_input(input),
        ),
        Err(e) => e,
    };
    respond(&ctx, &output)
}

/// Health check endpoint
#[get("/health")]
async fn health_check(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let health = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowhub",
        "operators": data.engine.operator_names().len(),
        "flows": data.engine.flow_ids().len(),
        "metrics": data.engine.metrics(),
    });
    respond(&request_context(&req), &Output::json(health))
}

/// Operators with their functions and each function's parameters
#[get("/api/operators")]
async fn list_operators(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let mut operators = BTreeMap::new();
    for name in data.engine.operator_names() {
        let Some(operator) = data.engine.operator(&name) else {
            continue;
        };
        let functions: BTreeMap<String, Vec<String>> = operator
            .functions()
            .into_iter()
            .map(|f| {
                let parameters = operator.parameters(&f);
                (f, parameters)
            })
            .collect();
        operators.insert(name, functions);
    }
    respond(&request_context(&req), &Output::object(&operators))
}

#[get("/api/flows")]
async fn list_flows(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    respond(&request_context(&req), &Output::object(&data.engine.all_flows()))
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");
    let mut events = data.engine.events().subscribe();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("WebSocket client missed {} events", missed);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

fn load_config(args: &Args) -> anyhow::Result<HubConfig> {
    let mut config = match &args.config {
        Some(path) => HubConfig::from_file(path)
            .with_context(|| format!("cannot read config {}", path.display()))?,
        None => HubConfig::default(),
    };
    if let Ok(address) = std::env::var("BIND_ADDRESS") {
        config.server.bind_address = address;
    }
    if let Ok(secs) = std::env::var("REQUEST_TIMEOUT_SECS") {
        config.server.request_timeout_secs = secs
            .parse()
            .with_context(|| format!("REQUEST_TIMEOUT_SECS is not a number: {}", secs))?;
    }
    Ok(config)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting flow hub");
    let config = load_config(&Args::parse())?;

    let store = Arc::new(Store::new(config.store.clone())?);
    let repository = Arc::new(StoreFlowRepository::from_store(&store)?);
    let engine = Arc::new(FlowEngine::new(config.runtime.clone()).with_repository(repository));
    let cancel = CancellationToken::new();
    flownodes::register_all(&engine, &store, &config, cancel.clone())?;

    let startup = Context::new("startup");
    engine.load_persisted_flows(&startup).await?;
    let loaded = engine.load_flows_from(&startup, &config.runtime.flow_dirs).await?;
    info!("✅ Loaded {} flows from {} flow dirs", loaded, config.runtime.flow_dirs.len());
    engine.start_listening(&startup).await;

    let dispatcher = Dispatcher::from_config(Arc::clone(&engine), cancel.clone());
    let app_state = web::Data::new(AppState {
        engine: Arc::clone(&engine),
        jobs: dispatcher.queue(),
        timeout: Duration::from_secs(config.server.request_timeout_secs),
    });

    let bind_address = config.server.bind_address.clone();
    info!("🌐 Server starting on http://{}", bind_address);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_operators)
            .service(list_flows)
            .service(websocket_events)
            .service(
                web::resource("/api/async/{operator}/{function}")
                    .route(web::get().to(queue_function))
                    .route(web::post().to(queue_function)),
            )
            .service(
                web::resource("/{operator}/{function}")
                    .route(web::get().to(call_function))
                    .route(web::post().to(call_function)),
            )
            .service(
                web::resource("/{operator}/{function}/{device}")
                    .route(web::get().to(call_device_function))
                    .route(web::post().to(call_device_function)),
            )
    })
    .bind(&bind_address)?
    .run();

    // system.stop cancels the token
    let handle = server.handle();
    let stop = cancel.clone();
    actix_web::rt::spawn(async move {
        stop.cancelled().await;
        info!("Stop requested");
        handle.stop(true).await;
    });

    server.await?;
    cancel.cancel();
    dispatcher.shutdown().await;
    engine.shutdown(&Context::new("shutdown")).await;
    info!("Flow hub stopped");
    Ok(())
}
