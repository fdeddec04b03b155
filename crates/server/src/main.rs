use std::{env, io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use taskd_server::{
    config::{self, CliOptions, EnvOverrides},
    journal::Journal,
    reclaim::spawn_reclaim_task,
    store::open_store,
    ConfirmAuth, TaskServer,
};
use tracing_subscriber::EnvFilter;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "taskd", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to taskd.toml
    #[arg(long = "config", value_name = "FILE", env = "TASKD_CONFIG")]
    config_path: Option<PathBuf>,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Shortcut for --log-level debug
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// Host binding for the HTTP server
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port binding for the HTTP server
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// SQLite database path
    #[arg(long = "db", value_name = "FILE", conflicts_with = "memory")]
    db_path: Option<PathBuf>,

    /// Keep tasks in memory only
    #[arg(long = "memory", action = ArgAction::SetTrue)]
    memory: bool,

    /// Shared secret used to derive host tokens
    #[arg(long = "secret", value_name = "SECRET")]
    secret: Option<String>,

    /// Admin bearer tokens for POST /api/tasks
    #[arg(long = "admin-token", value_name = "TOKEN")]
    admin_tokens: Vec<String>,

    /// Whether confirmations need a host token
    #[arg(long = "confirm-auth", value_enum, value_name = "MODE")]
    confirm_auth: Option<ConfirmAuthArg>,

    /// Additional CORS allowed origins
    #[arg(long = "cors-origin", value_name = "ORIGIN")]
    cors_origins: Vec<String>,

    /// Disable the stale dispatch sweep
    #[arg(long = "no-reclaim", action = ArgAction::SetTrue)]
    no_reclaim: bool,

    /// Append audit entries to this file (key from [journal].key or TASKD_JOURNAL_KEY)
    #[arg(long = "journal", value_name = "FILE")]
    journal_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfirmAuthArg {
    Required,
    Off,
}

impl From<ConfirmAuthArg> for ConfirmAuth {
    fn from(value: ConfirmAuthArg) -> Self {
        match value {
            ConfirmAuthArg::Required => ConfirmAuth::Required,
            ConfirmAuthArg::Off => ConfirmAuth::Off,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args);
    tracing::info!(
        "{}",
        taskd_build_info::formatted_banner("taskd", SERVER_VERSION)
    );

    let working_dir = env::current_dir().context("Failed to resolve working directory")?;
    let file_cfg = config::load_file_config(args.config_path.as_deref())?;
    if let (Some(path), None) = (&args.config_path, &file_cfg) {
        tracing::warn!("config file {} not found, using defaults", path.display());
    }

    let cli = CliOptions {
        host: args.host.clone(),
        port: args.port,
        db_path: args.db_path.clone(),
        memory: args.memory,
        secret: args.secret.clone(),
        admin_tokens: args.admin_tokens.clone(),
        confirm_auth: args.confirm_auth.map(ConfirmAuth::from),
        cors_origins: args.cors_origins.clone(),
        disable_reclaim: args.no_reclaim,
        journal_path: args.journal_path.clone(),
    };
    let config = config::resolve_config(
        &cli,
        &EnvOverrides::from_env(),
        file_cfg.as_ref(),
        &working_dir,
    )?;

    if config.uses_default_secret() {
        tracing::warn!(
            "running with the default shared secret; set TASKD_SECRET or [auth].secret before exposing taskd"
        );
    }
    if config.confirm_auth == ConfirmAuth::Off {
        tracing::warn!("confirm_auth is off: any client can confirm any dispatched task");
    }
    tracing::info!(
        store = ?config.store,
        previous_secrets = config.secrets.previous_count(),
        admin_enabled = !config.admin_tokens.is_empty(),
        "taskd configured"
    );

    let store = open_store(&config.store).context("Failed to open task store")?;
    let mut server = TaskServer::new(Arc::from(store), config.secrets.clone())
        .with_admin_tokens(config.admin_tokens.clone())
        .with_panel_token(config.panel_token.clone())
        .with_confirm_auth(config.confirm_auth);
    if let Some(journal) = &config.journal {
        let opened = Journal::open(&journal.path, &journal.key)
            .with_context(|| format!("Failed to open journal {}", journal.path.display()))?;
        tracing::info!("audit journal at {}", opened.path().display());
        server = server.with_journal(opened);
    }
    let server = Arc::new(server);

    let sweep = spawn_reclaim_task(Arc::clone(&server), config.reclaim.clone());

    let result = taskd_server::run_http_transport(server, config.http, shutdown_signal()).await;

    if let Some(handle) = sweep {
        handle.abort();
    }
    tracing::info!("taskd stopped");
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn init_tracing(args: &Args) {
    let filter = match (&args.log_level, args.debug) {
        (Some(level), _) => EnvFilter::new(level),
        (None, true) => EnvFilter::new("debug"),
        (None, false) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}
