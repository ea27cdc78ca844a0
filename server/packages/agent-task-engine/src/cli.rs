use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use agent_task_engine_error::EngineError;

use crate::catalog::{AgentCatalog, AgentSpec, CatalogError};
use crate::config::{self, EngineConfig};
use crate::dispatcher::TaskDispatcher;
use crate::reaper::reap_interrupted;
use crate::router::{build_router, ApiDoc, AppState};
use crate::store::{ExecutionStore, FileExecutionStore, MemoryExecutionStore};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;
const DEFAULT_AGENT: &str = "claude";

#[derive(Parser, Debug)]
#[command(name = "agent-task-engine", bin_name = "agent-task-engine")]
#[command(about = "Runs agent CLI tasks and streams their transcripts", version)]
#[command(arg_required_else_help = true)]
pub struct EngineCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Server(ServerArgs),
    /// Print the OpenAPI document.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// JSON agent catalog. Defaults to a single `claude` agent on PATH.
    #[arg(long)]
    agents: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep executions in memory only.
    #[arg(long, conflicts_with = "data_dir")]
    in_memory: bool,

    #[arg(long, default_value_t = config::DEFAULT_TIMEOUT_SECS)]
    default_timeout_secs: u64,

    #[arg(long, default_value_t = config::MAX_TIMEOUT_SECS)]
    max_timeout_secs: u64,

    #[arg(long, default_value_t = 2000)]
    kill_grace_ms: u64,

    /// Skip failing executions left unfinished by a previous run.
    #[arg(long)]
    no_reap: bool,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

impl ServerArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_timeout_secs: self.default_timeout_secs,
            max_timeout_secs: self.max_timeout_secs,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            data_dir: if self.in_memory {
                None
            } else {
                Some(self.data_dir.clone().unwrap_or_else(config::default_data_dir))
            },
            reap_on_start: !self.no_reap,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_engine() -> Result<(), CliError> {
    let cli = EngineCli::parse();
    init_logging();
    match &cli.command {
        Command::Server(args) => run_server(args),
        Command::Openapi => print_openapi(),
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn print_openapi() -> Result<(), CliError> {
    let doc = serde_json::to_string_pretty(&ApiDoc::openapi())?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{doc}")?;
    Ok(())
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    if server.default_timeout_secs == 0 || server.default_timeout_secs > server.max_timeout_secs {
        return Err(CliError::InvalidConfig(format!(
            "--default-timeout-secs must be between 1 and --max-timeout-secs ({})",
            server.max_timeout_secs
        )));
    }
    let config = server.engine_config();
    let catalog = match &server.agents {
        Some(path) => AgentCatalog::from_file(path)?,
        None => AgentCatalog::new([AgentSpec::new(DEFAULT_AGENT, DEFAULT_AGENT)])?,
    };
    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", server.host, server.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let store: Arc<dyn ExecutionStore> = match &config.data_dir {
            Some(dir) => {
                let store = FileExecutionStore::open(dir).await?;
                tracing::info!(path = %store.path().display(), "using file execution store");
                Arc::new(store)
            }
            None => {
                tracing::info!("using in-memory execution store");
                Arc::new(MemoryExecutionStore::new())
            }
        };
        if config.reap_on_start {
            let reaped = reap_interrupted(store.as_ref()).await?;
            if reaped > 0 {
                tracing::warn!(reaped, "failed executions interrupted by previous shutdown");
            }
        }

        tracing::info!(
            agents = catalog.list().len(),
            default_timeout_secs = config.default_timeout_secs,
            max_timeout_secs = config.max_timeout_secs,
            "starting agent task engine"
        );
        let dispatcher = Arc::new(TaskDispatcher::new(config, Arc::new(catalog), store));
        let router = build_router(AppState::new(dispatcher)).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors.allow_methods(Any).allow_headers(Any))
}
