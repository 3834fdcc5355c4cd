//! isogridd: the IsoGrid operator daemon.
//!
//! Single binary that assembles the IsoGrid subsystems over one on-disk
//! store and exposes every orchestrator entry point as a subcommand:
//! - Instance store (redb)
//! - Dependency graph + DNS cache
//! - Isolation orchestrator, fork engine, lifecycle monitor
//! - Auto-isolation trigger
//!
//! Queued follow-up work lands in the store outbox; `drain` consumes it.
//!
//! # Usage
//!
//! ```text
//! isogridd --config /etc/isogrid/isogrid.toml isolate request.toml --user 42
//! isogridd kill 5f0c... --redeploy
//! isogridd drain
//! ```

mod app;
mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use isogrid_core::IsoGridConfig;
use isogrid_state::ContainerStatus;

use crate::app::App;

const DEFAULT_CONFIG: &str = "/etc/isogrid/isogrid.toml";

#[derive(Parser)]
#[command(name = "isogridd", about = "IsoGrid isolation daemon", version)]
struct Cli {
    /// Path to isogrid.toml. A missing default file means built-in defaults.
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override the store path from the config file.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Starting,
    Running,
    Stopping,
    Exited,
    Dead,
}

impl From<StatusArg> for ContainerStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Starting => ContainerStatus::Starting,
            StatusArg::Running => ContainerStatus::Running,
            StatusArg::Stopping => ContainerStatus::Stopping,
            StatusArg::Exited => ContainerStatus::Exited,
            StatusArg::Dead => ContainerStatus::Dead,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Import instances and auto-isolation configurations from JSON.
    Seed { file: PathBuf },
    /// Create an isolation from a TOML request.
    Isolate {
        request: PathBuf,
        /// GitHub id of the acting user.
        #[arg(long)]
        user: u64,
    },
    /// Delete an isolation; children are queued for deletion.
    Delete { isolation_id: String },
    /// Start killing an isolation.
    Kill {
        isolation_id: String,
        /// Redeploy once every member has stopped.
        #[arg(long)]
        redeploy: bool,
    },
    /// Move a killing isolation to killed if every member has stopped.
    Reap { isolation_id: String },
    /// Mark a killed isolation as redeployed.
    Redeployed { isolation_id: String },
    /// Report a container status change.
    ContainerState {
        instance_id: String,
        container_id: String,
        #[arg(value_enum)]
        status: StatusArg,
    },
    /// Run auto-isolation for instances built from a push.
    OnPush {
        #[arg(required = true)]
        instance_ids: Vec<String>,
        /// GitHub id of the push author.
        #[arg(long)]
        pusher: Option<u64>,
    },
    /// Reconcile an instance's edges from its env.
    SyncDeps { instance_id: String },
    /// List instances depending on an instance.
    Dependents { instance_id: String },
    /// Resolve a hostname from an instance's point of view.
    Resolve {
        instance_id: String,
        hostname: String,
    },
    /// Show an isolation, checking the user owns it.
    Show {
        isolation_id: String,
        #[arg(long)]
        user: u64,
    },
    /// Process queued messages.
    Drain,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = load_config(&cli.config)?;
    if let Some(store) = cli.store {
        config.store.path = store;
    }
    let app = App::open(&config)?;

    let output = match cli.command {
        Command::Seed { file } => commands::seed(&app, &file)?,
        Command::Isolate { request, user } => commands::isolate(&app, &request, user).await?,
        Command::Delete { isolation_id } => commands::delete(&app, &isolation_id).await?,
        Command::Kill {
            isolation_id,
            redeploy,
        } => commands::kill(&app, &isolation_id, redeploy).await?,
        Command::Reap { isolation_id } => commands::reap(&app, &isolation_id).await?,
        Command::Redeployed { isolation_id } => {
            commands::redeployed(&app, &isolation_id).await?
        }
        Command::ContainerState {
            instance_id,
            container_id,
            status,
        } => {
            commands::container_state(&app, &instance_id, &container_id, status.into()).await?
        }
        Command::OnPush {
            instance_ids,
            pusher,
        } => commands::on_push(&app, &instance_ids, pusher).await?,
        Command::SyncDeps { instance_id } => commands::sync_deps(&app, &instance_id)?,
        Command::Dependents { instance_id } => commands::dependents(&app, &instance_id)?,
        Command::Resolve {
            instance_id,
            hostname,
        } => commands::resolve(&app, &instance_id, &hostname)?,
        Command::Show { isolation_id, user } => {
            commands::show(&app, &isolation_id, user).await?
        }
        Command::Drain => commands::drain(&app).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,isogrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<IsoGridConfig> {
    if !path.exists() && path == std::path::Path::new(DEFAULT_CONFIG) {
        debug!("no config file, using defaults");
        return Ok(IsoGridConfig::default());
    }
    let config = IsoGridConfig::from_file(path)?;
    info!(path = %path.display(), domain = %config.hostnames.domain, "config loaded");
    Ok(config)
}
