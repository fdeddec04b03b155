//! taskd agent
//!
//! Polls a taskd server for tasks addressed to this host, runs them and
//! reports the outcome.

use std::{io, path::PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use taskd_agent::{
    config::{self, CliOptions, EnvOverrides},
    CommandExecutor, ExecutorSet, HttpChannel, MessageExecutor, Poller,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskd-agent", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to agent TOML config
    #[arg(long = "config", value_name = "FILE", env = "TASKD_AGENT_CONFIG")]
    config_path: Option<PathBuf>,

    /// Server base URL (e.g. http://127.0.0.1:5000)
    #[arg(long = "server", value_name = "URL")]
    server: Option<String>,

    /// Identity this agent polls for
    #[arg(long = "host-id", value_name = "HOST")]
    host_id: Option<String>,

    /// Shared secret used to derive the host token
    #[arg(long = "secret", value_name = "SECRET")]
    secret: Option<String>,

    /// Seconds between polls
    #[arg(long = "interval", value_name = "SECS")]
    interval_secs: Option<u64>,

    /// Kill commands running longer than this
    #[arg(long = "command-timeout", value_name = "SECS")]
    command_timeout_secs: Option<u64>,

    /// Show messages through this program instead of the log
    #[arg(long = "notifier", value_name = "PROGRAM")]
    notifier: Option<String>,

    /// Run a single cycle and exit
    #[arg(long = "once", action = ArgAction::SetTrue)]
    once: bool,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Shortcut for --log-level debug
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);
    info!(
        "{}",
        taskd_build_info::formatted_banner("taskd-agent", env!("CARGO_PKG_VERSION"))
    );

    let file_cfg = config::load_file_config(args.config_path.as_deref())?;
    let cli = CliOptions {
        server_url: args.server.clone(),
        host_id: args.host_id.clone(),
        secret: args.secret.clone(),
        interval_secs: args.interval_secs,
        command_timeout_secs: args.command_timeout_secs,
        notifier: args.notifier.clone(),
    };
    let config = config::resolve_config(&cli, &EnvOverrides::from_env(), file_cfg.as_ref())?;
    if config.uses_default_secret() {
        warn!("using the default shared secret; the server will reject it unless it does too");
    }

    let channel = HttpChannel::new(
        &config.server_url,
        &config.host_id,
        &config.secrets,
        config.request_timeout,
    )
    .context("Failed to build HTTP client")?;
    let executors = ExecutorSet::new(
        MessageExecutor::new(config.message_surface.clone(), config.command_timeout),
        CommandExecutor::new(config.command_timeout),
    );
    let poller = Poller::new(channel, executors);

    info!(
        server = %config.server_url,
        host = %config.host_id,
        "agent started"
    );

    if args.once {
        let report = poller
            .run_cycle()
            .await
            .context("Failed to fetch tasks")?;
        info!(?report, "single cycle finished");
        return Ok(());
    }

    poller
        .run_until(config.interval, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for Ctrl-C: {err}");
                std::future::pending::<()>().await;
            }
        })
        .await;
    info!("agent stopped");
    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = match (&args.log_level, args.debug) {
        (Some(level), _) => EnvFilter::new(level),
        (None, true) => EnvFilter::new("debug"),
        (None, false) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
