use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_core::{check_binary, Client, Options, ProcessSupervisor, Settings};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;

use config::{parse_tunnel_flag, BurrowConfig, TunnelConfig};

const LOG_PREFIX: &str = "burrow";

/// Burrow - run a tunneling daemon and expose local services through it
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Expose local services through a supervised tunneling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ./burrow.toml or ~/.config/burrow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging, and per-attempt tunnel logs at info
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to a timestamped file in the log directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Daemon binary (overrides config and BURROW_BINARY)
    #[arg(long, global = true)]
    binary: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon, create tunnels and keep them open until interrupted
    Run {
        /// Tunnel to open, as proto:name:addr (repeatable)
        #[arg(short, long = "tunnel", value_parser = parse_tunnel_flag)]
        tunnels: Vec<TunnelConfig>,

        /// Daemon region
        #[arg(long)]
        region: Option<String>,

        /// Reserved subdomain
        #[arg(long)]
        subdomain: Option<String>,

        /// Account token registered before the daemon starts
        #[arg(long)]
        authtoken: Option<String>,

        /// Echo daemon output into the log
        #[arg(long)]
        log_daemon: bool,
    },

    /// Register an account token with the daemon
    Authtoken {
        token: String,
    },

    /// Verify that the daemon binary exists
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BurrowConfig::load_or_default(cli.config.as_deref())?;
    let mut settings = config.settings.resolve()?;
    if let Some(binary) = &cli.binary {
        settings.binary_path = binary.clone();
    }
    if cli.verbose {
        settings.verbose = true;
    }

    init_logging(cli.verbose, cli.log_file.then_some(settings.log_dir.as_path()))?;

    match cli.command {
        Commands::Run {
            tunnels,
            region,
            subdomain,
            authtoken,
            log_daemon,
        } => {
            let mut options = config.daemon;
            options.region = region.or(options.region);
            options.subdomain = subdomain.or(options.subdomain);
            options.auth_token = authtoken.or(options.auth_token);
            options.log_daemon_output |= log_daemon;
            if cli.binary.is_some() {
                options.binary_path = None;
            }

            // Flags replace the configured tunnel list rather than extend it
            let tunnels = if tunnels.is_empty() {
                config.tunnels
            } else {
                tunnels
            };

            // Signals are handled here so tunnels get closed before the daemon stops
            settings.exit_on_signal = false;
            run(Arc::new(settings), options, tunnels).await
        }
        Commands::Authtoken { token } => {
            let options = Options {
                auth_token: Some(token),
                ..config.daemon
            };
            let binary = options
                .binary_path
                .clone()
                .filter(|_| cli.binary.is_none())
                .unwrap_or_else(|| settings.resolve_binary());
            let supervisor = ProcessSupervisor::new(binary)?;
            supervisor
                .register_authtoken(&options)
                .await
                .context("Failed to register authtoken")?;
            println!("Authtoken saved");
            Ok(())
        }
        Commands::Check => {
            let binary = settings.resolve_binary();
            check_binary(&binary)?;
            println!("Daemon binary found at {}", binary.display());
            Ok(())
        }
    }
}

async fn run(settings: Arc<Settings>, options: Options, tunnels: Vec<TunnelConfig>) -> Result<()> {
    if tunnels.is_empty() {
        anyhow::bail!("No tunnels configured. Use --tunnel proto:name:addr or a [[tunnels]] table");
    }

    let mut client = Client::new(options, settings)?;
    for tunnel in tunnels {
        client.add_tunnel(tunnel.into_tunnel());
    }

    let control_addr = client.start().await.context("Daemon failed to start")?;
    tracing::info!(control_addr = %control_addr, pid = ?client.pid(), "Daemon ready");

    let reports = client.connect_all().await?;
    let mut connected = 0;
    for report in &reports {
        match &report.result {
            Ok(public_url) => {
                connected += 1;
                let local = client
                    .tunnel(&report.name)
                    .map(|t| t.local_addr().to_string())
                    .unwrap_or_default();
                println!("{:<16} {} -> {}", report.name, public_url, local);
            }
            Err(e) => eprintln!("{:<16} failed: {}", report.name, e),
        }
    }

    if connected == 0 {
        client.close().await?;
        anyhow::bail!("No tunnel could be created");
    }

    for report in client.serve_until(shutdown_signal()).await? {
        if let Err(e) = report.result {
            tracing::warn!(tunnel = %report.name, error = %e, "Tunnel did not close cleanly");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("burrow={}", level).parse()?)
        .add_directive(format!("burrow_core={}", level).parse()?);

    let file_layer = match log_dir {
        Some(dir) => {
            let file = open_log_file(dir)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn open_log_file(dir: &Path) -> Result<std::fs::File> {
    if !dir.exists() {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let path = dir.join(format!("{}_{}.log", LOG_PREFIX, timestamp));
    std::fs::File::create(&path).with_context(|| format!("Failed to create {}", path.display()))
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
