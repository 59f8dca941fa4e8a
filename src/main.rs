use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use panelflow::bit::BitRegistry;
use panelflow::config::EngineConfig;
use panelflow::engine::{Engine, RunMode};
use panelflow::event::EventBus;
use panelflow::flow::compile_json;
use panelflow::invocation::{EchoWorker, InvocationManager};
use panelflow::ledger::{MeteringGate, Tariffs};
use panelflow::logger::init_tracing;
use panelflow::manager::FlowManager;
use panelflow::schema::write_schema;
use panelflow::server::serve;
use panelflow::wall::InMemoryWall;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "panelflow", about = "Flow & bit orchestration for panel workspaces", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the API server
    Run(RunArgs),

    /// Emit the flow-document JSON schema
    Schema(SchemaArgs),

    /// Validate or execute flow files locally
    Flow(FlowArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Optional JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override (e.g. 127.0.0.1:8080)
    #[arg(long)]
    addr: Option<String>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory for schema files
    #[arg(long, default_value = "schemas")]
    out_dir: PathBuf,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Compile a flow file and report validation errors
    Validate { file: PathBuf },
    /// Execute a flow file once with the bundled echo worker
    Run {
        file: PathBuf,
        /// Inline JSON trigger payload
        #[arg(long, default_value = "{}")]
        input: String,
        /// dry or live
        #[arg(long, default_value = "dry")]
        mode: String,
    },
}

fn build_manager(config: &EngineConfig) -> anyhow::Result<Arc<FlowManager>> {
    let tariffs = match &config.tariff_file {
        Some(path) => Tariffs::from_file(path)?,
        None => Tariffs::builtin(),
    };
    let registry = Arc::new(BitRegistry::with_builtins());
    let gate = MeteringGate::new(tariffs, config.opening_balance);
    let bus = EventBus::new();
    let wall = InMemoryWall::new();
    let invocations = InvocationManager::with_worker(Arc::new(EchoWorker), bus.clone());
    let engine = Arc::new(
        Engine::new(registry.clone(), gate.clone(), invocations.clone(), wall.clone(), bus.clone())
            .with_poll_budget(config.poll_budget()),
    );
    Ok(FlowManager::new(registry, engine, gate, invocations, wall, bus))
}

fn parse_mode(raw: &str) -> anyhow::Result<RunMode> {
    match raw.to_lowercase().as_str() {
        "dry" => Ok(RunMode::Dry),
        "live" => Ok(RunMode::Live),
        other => bail!("unknown mode `{other}`, expected dry or live"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let mut config = EngineConfig::load(args.config.as_deref())?;
            if let Some(addr) = args.addr {
                config.listen_addr = addr;
            }
            let _guard = init_tracing(&config.log_level, config.log_dir.as_deref())?;

            let manager = build_manager(&config)?;
            let trigger_loop = manager.spawn_trigger_loop();
            info!("panelflow starting on {}", config.listen_addr);

            tokio::select! {
                result = serve(manager, &config.listen_addr) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    trigger_loop.abort();
                }
            }
            Ok(())
        }
        Commands::Schema(args) => {
            let path = write_schema(&args.out_dir)?;
            println!("Schema written to {}", path.display());
            Ok(())
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => {
                let raw = std::fs::read_to_string(&file)?;
                let doc: serde_json::Value = serde_json::from_str(&raw)?;
                let registry = BitRegistry::with_builtins();
                match compile_json(&doc, &registry) {
                    Ok(flow) => {
                        println!("Flow `{}` is valid.", flow.id());
                        for warning in flow.warnings() {
                            println!("warning: {warning}");
                        }
                        Ok(())
                    }
                    Err(e) => bail!("validation failed ({}): {e}", e.kind()),
                }
            }
            FlowCommands::Run { file, input, mode } => {
                let config = EngineConfig::load(None)?;
                let _guard = init_tracing(&config.log_level, None)?;
                let mode = parse_mode(&mode)?;
                let trigger: serde_json::Value = serde_json::from_str(&input)?;

                let raw = std::fs::read_to_string(&file)?;
                let doc: serde_json::Value = serde_json::from_str(&raw)?;
                let manager = build_manager(&config)?;
                let (flow_id, warnings) = manager
                    .register_flow(&doc)
                    .map_err(|e| anyhow::anyhow!("validation failed ({}): {e}", e.kind()))?;
                for warning in &warnings {
                    println!("warning: {warning}");
                }

                let run_id = manager.start_run(&flow_id, trigger, mode, None)?;
                let run = loop {
                    match manager.run_record(&run_id) {
                        Some(run) if run.finished_at.is_some() => break run,
                        _ => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                    }
                };
                println!("{}", serde_json::to_string_pretty(&run)?);
                Ok(())
            }
        },
    }
}
