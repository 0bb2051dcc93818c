use anyhow::{anyhow, bail, Context as _, Result};
use clap::{Parser, Subcommand};
use flowcore::{Context, ExecutionEvent, FlowDesc, FunctionArguments, OperationDesc, Output};
use flowruntime::{loader, FlowEngine, HubConfig};
use flowstore::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow hub CLI", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true, env = "FLOWHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file
    Run {
        /// Path to the flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Flow to run when the file holds several
        #[arg(long)]
        flow: Option<String>,

        /// Main input as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Main arguments as key=value
        #[arg(short, long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to the flow JSON file
        file: PathBuf,
    },

    /// List operators with their functions and parameters
    Operators,

    /// Call a single operator function
    Call {
        operator: String,
        function: String,

        #[arg(short, long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,

        /// Main input as JSON
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Create an example flow file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got \"{}\"", raw))
}

fn parse_input(input: Option<String>) -> Result<Output> {
    match input {
        None => Ok(Output::empty()),
        Some(text) => match serde_json::from_str(&text) {
            Ok(value) => Ok(Output::json(value)),
            Err(_) => Ok(Output::plain(text)),
        },
    }
}

/// An engine with the built-in operators, configured like the server
fn hub(config: Option<&PathBuf>) -> Result<(Arc<FlowEngine>, CancellationToken)> {
    let config = match config {
        Some(path) => HubConfig::from_file(path)
            .with_context(|| format!("cannot read config {}", path.display()))?,
        None => HubConfig::default(),
    };
    let store = Arc::new(Store::new(config.store.clone())?);
    let engine = Arc::new(FlowEngine::new(config.runtime.clone()));
    let cancel = CancellationToken::new();
    flownodes::register_all(&engine, &store, &config, cancel.clone())?;
    Ok((engine, cancel))
}

fn print_output(output: &Output) {
    println!();
    if output.is_error() {
        println!("💥 Failed with status {}: {}", output.status_code(), output.to_text());
    } else {
        println!("📤 Output ({}, status {}):", output.kind(), output.status_code());
        let text = output.to_text();
        if !text.is_empty() {
            println!("{}", text);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match &cli.command {
        Commands::Run { verbose: true, .. } => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Run {
            file,
            flow,
            input,
            args,
            ..
        } => run_flow(cli.config.as_ref(), file, flow, input, args).await,
        Commands::Validate { file } => validate_flows(cli.config.as_ref(), file),
        Commands::Operators => list_operators(cli.config.as_ref()),
        Commands::Call {
            operator,
            function,
            args,
            input,
        } => call_operator(cli.config.as_ref(), operator, function, args, input).await,
        Commands::Init { output } => create_example_flow(output),
    }
}

async fn run_flow(
    config: Option<&PathBuf>,
    file: PathBuf,
    flow: Option<String>,
    input: Option<String>,
    args: Vec<(String, String)>,
) -> Result<()> {
    println!("🚀 Loading flows from: {}", file.display());
    let (engine, _cancel) = hub(config)?;
    let ctx = Context::new("cli run");

    let flows = loader::read_flows(&file)?;
    let Some((first, _)) = flows.first() else {
        bail!("{} holds no flows", file.display());
    };
    let id = flow.unwrap_or_else(|| first.clone());
    for (flow_id, desc) in flows {
        println!("📋 Flow: {} ({} operations)", flow_id, desc.operations.len());
        engine.add_flow(&ctx, &flow_id, desc, true).await?;
    }
    println!();

    let mut events = engine.events().subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::FlowStarted { flow_id, .. } => {
                    println!("▶️  Flow {} started", flow_id);
                }
                ExecutionEvent::OperationCompleted {
                    operation,
                    operator,
                    function,
                    status,
                    duration_ms,
                    ..
                } => {
                    let mark = if status < 300 { "✅" } else { "❌" };
                    println!(
                        "  {} {} ({}.{}) returned {} in {}ms",
                        mark, operation, operator, function, status, duration_ms
                    );
                }
                ExecutionEvent::FlowCompleted {
                    flow_id,
                    success,
                    duration_ms,
                    ..
                } => {
                    if success {
                        println!("✨ Flow {} completed in {}ms", flow_id, duration_ms);
                    } else {
                        println!("💥 Flow {} failed after {}ms", flow_id, duration_ms);
                    }
                }
                ExecutionEvent::FlowsChanged { .. } => {}
            }
        }
    });

    let args: FunctionArguments = args.into_iter().collect();
    let output = engine.execute_flow(&ctx, &id, args, parse_input(input)?).await;

    // let the event task print what is already queued
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    print_output(&output);
    if output.is_error() {
        return Err(anyhow!("flow {} failed", id));
    }
    Ok(())
}

fn validate_flows(config: Option<&PathBuf>, file: PathBuf) -> Result<()> {
    println!("🔍 Validating flows: {}", file.display());
    let (engine, _cancel) = hub(config)?;

    let mut invalid = 0;
    for (id, desc) in loader::read_flows(&file)? {
        match desc.validate(&id, |name| engine.has_operator(name)) {
            Ok(flow) => {
                println!("✅ {} (\"{}\")", id, flow.desc().display_name);
                println!("   Operations: {}", flow.operations().len());
                println!("   Output from: {}", flow.output_from());
                if !flow.desc().tags.is_empty() {
                    println!("   Tags: {}", flow.desc().tags.join(", "));
                }
            }
            Err(e) => {
                invalid += 1;
                println!("❌ {}: {}", id, e);
            }
        }
    }
    if invalid > 0 {
        bail!("{} invalid flows", invalid);
    }
    Ok(())
}

fn list_operators(config: Option<&PathBuf>) -> Result<()> {
    println!("📦 Available operators:");
    println!();
    let (engine, _cancel) = hub(config)?;

    for name in engine.operator_names() {
        let Some(operator) = engine.operator(&name) else {
            continue;
        };
        println!("  • {}", name);
        for function in operator.functions() {
            let parameters = operator.parameters(&function);
            if parameters.is_empty() {
                println!("      {}", function);
            } else {
                println!("      {}({})", function, parameters.join(", "));
            }
        }
    }
    Ok(())
}

async fn call_operator(
    config: Option<&PathBuf>,
    operator: String,
    function: String,
    args: Vec<(String, String)>,
    input: Option<String>,
) -> Result<()> {
    let (engine, _cancel) = hub(config)?;
    let ctx = Context::new("cli call");
    let args: FunctionArguments = args.into_iter().collect();
    let output = engine
        .execute_operator(&ctx, &operator, &function, args, parse_input(input)?)
        .await;
    print_output(&output);
    if output.is_error() {
        return Err(anyhow!("{}.{} failed", operator, function));
    }
    Ok(())
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let flow = FlowDesc::new("Remember greeting")
        .with_tags(["example", "room:hall"])
        .with_operation(
            OperationDesc::new("utils", "echo")
                .named("greet")
                .with_argument("output", "hello"),
        )
        .with_operation(
            OperationDesc::new("store", "set")
                .named("save")
                .input_from("greet")
                .with_argument("namespace", "greetings")
                .with_argument("key", "hall")
                .use_main_args(false),
        )
        .with_operation(
            OperationDesc::new("store", "get")
                .named("load")
                .on_success_of("save")
                .with_argument("namespace", "greetings")
                .with_argument("key", "hall")
                .with_argument("output", "direct")
                .use_main_args(false),
        )
        .output_from("load");

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(parse_key_val("room=hall").unwrap(), ("room".to_string(), "hall".to_string()));
        assert_eq!(parse_key_val("expr=a=b").unwrap().1, "a=b");
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_parse_input() {
        assert!(parse_input(None).unwrap().is_empty());
        assert_eq!(parse_input(Some(r#"{"a":1}"#.into())).unwrap().to_json()["a"], 1);
        assert_eq!(parse_input(Some("plain words".into())).unwrap().to_text(), "plain words");
    }
}
