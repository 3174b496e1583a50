//! `rusty-conductor` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`   : start the API server, the sweeper and the in-process workers.
//! - `migrate` : run pending database migrations.
//! - `validate`: validate a workflow definition JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engine::dag::DefinitionIndex;
use engine::modules::{BuiltinModule, ModuleRegistry};
use engine::{
    EngineConfig, ExecutionStore, MemoryStore, PayloadThresholds, PgStore, ServerIdentity, Sweeper,
    WorkerPool, WorkflowDefinition, WorkflowExecutor,
};
use queue::{MemoryQueue, PgTaskQueue, TaskQueue};

#[derive(Parser)]
#[command(
    name = "rusty-conductor",
    about = "Workflow orchestration engine",
    version
)]
struct Cli {
    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server with the sweeper and in-process workers.
    Serve(ServeArgs),
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
}

/// Runtime modules selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModuleName {
    AuditLog,
    Echo,
}

impl From<ModuleName> for BuiltinModule {
    fn from(name: ModuleName) -> Self {
        match name {
            ModuleName::AuditLog => BuiltinModule::AuditLog,
            ModuleName::Echo => BuiltinModule::Echo,
        }
    }
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Postgres connection string. Without it state is kept in memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    #[arg(long, env = "CONDUCTOR_SWEEP_INTERVAL_SECONDS", default_value_t = 30)]
    sweep_interval_seconds: u64,

    #[arg(long, env = "CONDUCTOR_SWEEP_DISABLED")]
    sweep_disabled: bool,

    #[arg(long, env = "CONDUCTOR_ASYNC_WORKERS_DISABLED")]
    async_workers_disabled: bool,

    #[arg(long, env = "CONDUCTOR_LEASE_SECONDS", default_value_t = 60)]
    lease_seconds: u64,

    /// Runtime modules to load, comma separated.
    #[arg(long, env = "CONDUCTOR_ADDITIONAL_MODULES", value_enum, value_delimiter = ',')]
    modules: Vec<ModuleName>,

    #[command(flatten)]
    payload: PayloadArgs,

    #[command(flatten)]
    identity: IdentityArgs,
}

#[derive(Args)]
struct PayloadArgs {
    #[arg(long, env = "CONDUCTOR_WORKFLOW_INPUT_KB", default_value_t = 5120)]
    workflow_input_kb: u64,
    #[arg(long, env = "CONDUCTOR_MAX_WORKFLOW_INPUT_KB", default_value_t = 10240)]
    max_workflow_input_kb: u64,
    #[arg(long, env = "CONDUCTOR_WORKFLOW_OUTPUT_KB", default_value_t = 5120)]
    workflow_output_kb: u64,
    #[arg(long, env = "CONDUCTOR_MAX_WORKFLOW_OUTPUT_KB", default_value_t = 10240)]
    max_workflow_output_kb: u64,
    #[arg(long, env = "CONDUCTOR_TASK_INPUT_KB", default_value_t = 3072)]
    task_input_kb: u64,
    #[arg(long, env = "CONDUCTOR_MAX_TASK_INPUT_KB", default_value_t = 10240)]
    max_task_input_kb: u64,
    #[arg(long, env = "CONDUCTOR_TASK_OUTPUT_KB", default_value_t = 3072)]
    task_output_kb: u64,
    #[arg(long, env = "CONDUCTOR_MAX_TASK_OUTPUT_KB", default_value_t = 10240)]
    max_task_output_kb: u64,
}

#[derive(Args)]
struct IdentityArgs {
    #[arg(long, env = "CONDUCTOR_SERVER_ID", default_value = "unknown")]
    server_id: String,
    #[arg(long, env = "CONDUCTOR_ENVIRONMENT", default_value = "test")]
    environment: String,
    #[arg(long, env = "CONDUCTOR_STACK", default_value = "test")]
    stack: String,
    #[arg(long, env = "CONDUCTOR_APP_ID", default_value = "conductor")]
    app_id: String,
    #[arg(long, env = "CONDUCTOR_REGION", default_value = "us-east-1")]
    region: String,
    #[arg(long, env = "CONDUCTOR_AVAILABILITY_ZONE", default_value = "us-east-1c")]
    availability_zone: String,
}

impl ServeArgs {
    fn engine_config(&self) -> EngineConfig {
        let payload = &self.payload;
        let identity = &self.identity;
        EngineConfig {
            sweep_interval_seconds: self.sweep_interval_seconds,
            sweep_disabled: self.sweep_disabled,
            async_workers_disabled: self.async_workers_disabled,
            lease_seconds: self.lease_seconds,
            payload: PayloadThresholds {
                workflow_input_kb: payload.workflow_input_kb,
                max_workflow_input_kb: payload.max_workflow_input_kb,
                workflow_output_kb: payload.workflow_output_kb,
                max_workflow_output_kb: payload.max_workflow_output_kb,
                task_input_kb: payload.task_input_kb,
                max_task_input_kb: payload.max_task_input_kb,
                task_output_kb: payload.task_output_kb,
                max_task_output_kb: payload.max_task_output_kb,
            },
            identity: ServerIdentity {
                server_id: identity.server_id.clone(),
                environment: identity.environment.clone(),
                stack: identity.stack.clone(),
                app_id: identity.app_id.clone(),
                region: identity.region.clone(),
                availability_zone: identity.availability_zone.clone(),
            },
            additional_modules: self
                .modules
                .iter()
                .map(|&name| BuiltinModule::from(name).factory())
                .collect(),
            ..EngineConfig::default()
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
            Ok(())
        }
        Command::Validate { path } => validate(&path),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.engine_config();

    let (store, queue): (Arc<dyn ExecutionStore>, Arc<dyn TaskQueue>) = match &args.database_url {
        Some(url) => {
            let pool = db::pool::create_pool(url, args.max_connections)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            (Arc::new(PgStore::new(pool.clone())), Arc::new(PgTaskQueue::new(pool)))
        }
        None => {
            warn!("no database configured; executions are kept in memory");
            (Arc::new(MemoryStore::new()), Arc::new(MemoryQueue::new()))
        }
    };

    let modules = ModuleRegistry::load(&config.additional_modules);
    let executor = Arc::new(
        WorkflowExecutor::new(store, queue, config.clone()).with_listeners(modules.listeners().to_vec()),
    );

    let shutdown = CancellationToken::new();
    let mut background = vec![tokio::spawn(
        Sweeper::new(executor.clone(), &config).run(shutdown.clone()),
    )];
    if config.async_workers_disabled {
        info!("in-process workers disabled");
    } else {
        let worker_id = format!("{}-inproc", config.identity.server_id);
        let pool = WorkerPool::new(executor.clone(), modules.handlers().clone(), worker_id);
        background.extend(pool.spawn(shutdown.clone()));
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal.cancel();
    });

    info!(bind = %args.bind, "Starting API server");
    api::serve(&args.bind, api::AppState::new(executor), shutdown.clone())
        .await
        .context("API server failed")?;

    shutdown.cancel();
    for handle in background {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let definition: WorkflowDefinition = serde_json::from_str(&content).context("invalid JSON")?;

    match DefinitionIndex::build(&definition) {
        Ok(index) => {
            println!(
                "✅ Workflow '{}' v{} is valid ({} tasks).",
                definition.name,
                definition.version,
                index.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Validation failed: {e}");
            std::process::exit(1);
        }
    }
}
