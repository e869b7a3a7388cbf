//! shellbox: run shell commands inside a sandbox
//!
//! Usage:
//!   shellbox exec -- cargo test
//!   shellbox exec --sandbox docker --image node:20 -- npm ci
//!   shellbox serve --addr 0.0.0.0:3000
//!   shellbox history --limit 10
//!   shellbox doctor
//!   shellbox cleanup

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use shellbox_core::config::parse_sandbox_env;
use shellbox_core::engine::container::reclaim_shared_resources;
use shellbox_core::{
    ContainerEngine, ExecutionRequest, ExecutionService, Platform, SandboxSettings, ShellboxConfig,
    doctor, result,
};
use shellbox_gateway::GatewayServer;
use shellbox_history::HistoryDb;

#[derive(Debug, Parser)]
#[command(name = "shellbox", version, about = "Run shell commands inside OS-profile or container sandboxes")]
struct Cli {
    /// Config file (default: ~/.shellbox/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one command and print its output
    Exec {
        /// Command to run with `sh -c`; multiple words are joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        /// Working directory (default: current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Short description recorded in logs
        #[arg(long, default_value = "")]
        description: String,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },

    /// Serve the HTTP gateway
    Serve {
        /// Listen address (default: [gateway] addr or PORT)
        #[arg(long)]
        addr: Option<String>,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },

    /// Show recorded executions
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Only this session
        #[arg(long)]
        session: Option<String>,

        /// Print raw JSON entries
        #[arg(long)]
        json: bool,
    },

    /// Check that the configured sandbox can run on this host
    Doctor,

    /// Remove the shared sandbox network and proxy container
    Cleanup {
        /// Container engine (default: configured engine)
        #[arg(long)]
        engine: Option<String>,
    },
}

/// Sandbox flags; they override the environment and the config file
#[derive(Debug, Clone, Default, Args)]
struct SandboxArgs {
    /// Sandbox mode: disabled, os-profile/sandbox-exec, container, docker, podman, true
    #[arg(long)]
    sandbox: Option<String>,

    /// Seatbelt profile for the os-profile mode
    #[arg(long)]
    profile: Option<String>,

    /// Container image for the container mode
    #[arg(long)]
    image: Option<String>,

    /// Timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl SandboxArgs {
    fn apply(&self, settings: &mut SandboxSettings, platform: Platform) -> Result<()> {
        if let Some(raw) = &self.sandbox {
            let (mode, engine) = parse_sandbox_env(raw, platform)?;
            settings.mode = mode;
            if let Some(engine) = engine {
                settings.engine = engine;
            }
        }
        if let Some(profile) = &self.profile {
            settings.profile = profile.clone();
        }
        if let Some(image) = &self.image {
            settings.image = image.clone();
        }
        if let Some(timeout) = self.timeout {
            settings.timeout_secs = timeout;
        }
        Ok(())
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            token.cancel();
        }
    });
}

fn load_config(cli: &Cli, sandbox: Option<&SandboxArgs>, platform: Platform) -> Result<ShellboxConfig> {
    let mut config = ShellboxConfig::load_with_env(cli.config.as_deref())?;
    if let Some(args) = sandbox {
        args.apply(&mut config.sandbox, platform)?;
    }
    debug!("Effective config: {:?}", config);
    Ok(config)
}

async fn cmd_exec(
    config: ShellboxConfig,
    command: Vec<String>,
    dir: Option<PathBuf>,
    description: String,
    platform: Platform,
) -> Result<ExitCode> {
    let directory = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let request = ExecutionRequest {
        command: command.join(" "),
        description,
        directory: directory.to_string_lossy().into_owned(),
        ..ExecutionRequest::default()
    };

    let service = ExecutionService::new(Arc::new(config.sandbox), platform);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let outcome = service.run(&request, cancel).await?;
    print!("{}", result::map(&outcome).display_text);

    Ok(if outcome.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_serve(config: ShellboxConfig, addr: Option<String>, platform: Platform) -> Result<()> {
    let history = if config.history.enabled {
        Some(HistoryDb::new(config.history.resolved_path())?)
    } else {
        None
    };
    let addr = addr.unwrap_or_else(|| config.gateway.addr.clone());
    let service = ExecutionService::new(Arc::new(config.sandbox), platform);

    let server = GatewayServer::new(Arc::new(service), history);
    cancel_on_ctrl_c(server.shutdown_token());
    server.run(&addr).await
}

async fn cmd_history(
    config: ShellboxConfig,
    limit: usize,
    session: Option<String>,
    json: bool,
) -> Result<()> {
    let path = config.history.resolved_path();
    if !path.exists() {
        println!("No history yet ({})", path.display());
        return Ok(());
    }
    let db = HistoryDb::new(&path)?;
    let entries = match &session {
        Some(session) => db.list_session(session, Some(limit)).await?,
        None => db.list(Some(limit)).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No history entries");
    }
    for entry in entries {
        println!(
            "#{:<5} {}  {:<12} {}",
            entry.id,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.session_id,
            entry.request["command"].as_str().unwrap_or("?")
        );
    }
    Ok(())
}

async fn cmd_doctor(cli: &Cli, config: ShellboxConfig, platform: Platform) -> Result<ExitCode> {
    let report = doctor::run_doctor(&config, cli.config.as_deref(), platform).await;
    for check in &report.checks {
        println!("[{}] {}: {}", check.status, check.name, check.message);
        if let Some(hint) = &check.fix_hint {
            println!("       hint: {}", hint);
        }
    }
    println!("\n{}", report.summary());
    Ok(if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_cleanup(config: ShellboxConfig, engine: Option<String>) -> Result<()> {
    let engine = match engine {
        Some(raw) => raw.parse::<ContainerEngine>()?,
        None => config.sandbox.engine,
    };
    reclaim_shared_resources(engine)
        .await
        .with_context(|| format!("Failed to clean up {} resources", engine.binary()))?;
    println!("Removed shared {} sandbox resources", engine.binary());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let platform = Platform::current();

    match &cli.command {
        Command::Exec {
            command,
            dir,
            description,
            sandbox,
        } => {
            let config = load_config(&cli, Some(sandbox), platform)?;
            cmd_exec(config, command.clone(), dir.clone(), description.clone(), platform).await
        }
        Command::Serve { addr, sandbox } => {
            let config = load_config(&cli, Some(sandbox), platform)?;
            cmd_serve(config, addr.clone(), platform).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::History {
            limit,
            session,
            json,
        } => {
            let config = load_config(&cli, None, platform)?;
            cmd_history(config, *limit, session.clone(), *json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor => {
            let config = load_config(&cli, None, platform)?;
            cmd_doctor(&cli, config, platform).await
        }
        Command::Cleanup { engine } => {
            let config = load_config(&cli, None, platform)?;
            cmd_cleanup(config, engine.clone()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
