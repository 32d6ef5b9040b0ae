use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ensemble_core::config::{EnsembleConfig, TransportKind};
use ensemble_core::dashboard::{DashboardClient, HttpDashboardClient, MemoryDashboard};
use ensemble_engine::coordinator::{CoordinatorConfig, WorkflowCoordinator};
use ensemble_engine::engine::{EngineServices, WorkflowEngine};
use ensemble_engine::steps::build_registry;
use ensemble_transport::{MemoryTransport, RedisTransport, StreamTransport};
use ensemble_worker::{DuplicateTracker, PersonaPool, PoolConfig};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ensemble", about = "Persona workflow engine", version)]
struct Cli {
    /// Path to the configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding workflow definitions
    #[arg(long, global = true, default_value = "workflows")]
    workflows_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator consumer until interrupted (default)
    Serve,
    /// Coordinate one project and exit
    Coordinate {
        /// Project to coordinate
        #[arg(long)]
        project_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match EnsembleConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ensemble: failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&config);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Init(e)) => {
            tracing::error!("fatal init error: {e:#}");
            ExitCode::from(1)
        }
        Err(RunError::Coordinator(e)) => {
            tracing::error!("coordinator failed: {e:#}");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    Init(anyhow::Error),
    Coordinator(anyhow::Error),
}

fn init_tracing(config: &EnsembleConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log.level.clone().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect_transport(
    config: &EnsembleConfig,
) -> anyhow::Result<Arc<dyn StreamTransport>> {
    let transport: Arc<dyn StreamTransport> = match config.transport {
        TransportKind::Redis => Arc::new(RedisTransport::new(config.effective_redis_url())),
        TransportKind::Local => Arc::new(MemoryTransport::new()),
    };
    transport.connect().await?;
    tracing::info!(kind = ?config.transport, "transport connected");
    Ok(transport)
}

fn build_dashboard(config: &EnsembleConfig) -> Arc<dyn DashboardClient> {
    match &config.dashboard_url {
        Some(url) => Arc::new(HttpDashboardClient::new(url.clone())),
        None => {
            tracing::warn!("no dashboard_url configured, using an empty in-memory dashboard");
            Arc::new(MemoryDashboard::new())
        }
    }
}

async fn run(cli: Cli, config: EnsembleConfig) -> Result<(), RunError> {
    let transport = connect_transport(&config).await.map_err(RunError::Init)?;
    let dashboard = build_dashboard(&config);

    let services = Arc::new(
        EngineServices {
            transport: Arc::clone(&transport),
            dashboard: Some(Arc::clone(&dashboard)),
            request_stream: config.request_stream.clone(),
            response_stream: config.response_stream.clone(),
            allow_workspace_git: config.allow_workspace_git,
            blocked_exts: config.blocked_exts.clone(),
            write_diagnostics: config.write_diagnostics,
            workflows_dir: cli.workflows_dir.clone(),
        },
    );
    let registry = build_registry(Arc::clone(&services));
    let engine = WorkflowEngine::new(registry, Arc::clone(&services));
    let coordinator = Arc::new(WorkflowCoordinator::new(
        engine,
        Arc::clone(&dashboard),
        CoordinatorConfig::new(cli.workflows_dir.clone(), config.project_base.clone()),
    ));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Coordinate { project_id } => {
            let outcome = coordinator
                .coordinate_project(&project_id)
                .await
                .map_err(|e| RunError::Coordinator(e.into()))?;
            let report = serde_json::to_string_pretty(&outcome)
                .unwrap_or_else(|_| "{}".to_string());
            println!("{report}");
            if outcome.success {
                Ok(())
            } else {
                Err(RunError::Coordinator(anyhow::anyhow!(
                    "{} of {} tasks failed",
                    outcome.results.iter().filter(|r| !r.success).count(),
                    outcome.results.len()
                )))
            }
        }
        Command::Serve => serve(transport, config, coordinator).await,
    }
}

/// Long-running mode: consume coordinator messages from the shared request
/// stream and fan each into workflow runs.
async fn serve(
    transport: Arc<dyn StreamTransport>,
    config: EnsembleConfig,
    coordinator: Arc<WorkflowCoordinator>,
) -> Result<(), RunError> {
    let tracker = DuplicateTracker::new();
    tracker.start_sweeper(Duration::from_secs(600));

    let pool = PersonaPool::new(
        Arc::clone(&transport),
        config.request_stream.clone(),
        config.response_stream.clone(),
        tracker.clone(),
        PoolConfig::default(),
    );

    // This process hosts the coordinator persona; LLM-backed personas run in
    // their own workers and join the same consumer group.
    {
        let coordinator = Arc::clone(&coordinator);
        pool.register_handler(ensemble_core::personas::COORDINATOR, move |request| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                let project_id = request
                    .project_id
                    .clone()
                    .or_else(|| {
                        request
                            .payload
                            .get("project_id")
                            .and_then(serde_json::Value::as_str)
                            .map(String::from)
                    })
                    .ok_or_else(|| "coordinate message carries no project_id".to_string())?;
                let outcome = coordinator
                    .coordinate_project(&project_id)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(&outcome).map_err(|e| e.to_string()).map(|v| {
                    json!({
                        "status": if outcome.success { "pass" } else { "fail" },
                        "output": v,
                    })
                })
            }
        });
    }

    pool.start().await.map_err(|e| RunError::Init(e.into()))?;
    tracing::info!("ensemble serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| RunError::Init(e.into()))?;
    tracing::info!("shutdown signal received");

    pool.stop().await;
    tracker.stop_sweeper().await;
    transport
        .disconnect()
        .await
        .map_err(|e| RunError::Init(e.into()))?;
    Ok(())
}
