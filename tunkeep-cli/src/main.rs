//! Tunkeep CLI
//!
//! Keeps a tunnel interface up around an external engine process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keep_tun::SystemTunPlatform;
use tunkeep_engine::watcher::DEFAULT_POLL_INTERVAL;
use tunkeep_engine::{
    ChannelObserver, Config, ProcessEngine, ProcessSettings, RouteWatcher, StatusEvent,
    TunnelController, TunnelState,
};

/// How long to wait for the engine to wind down after a signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunkeep - supervised tunnel lifecycle controller
#[derive(Parser)]
#[command(name = "tunkeep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up and keep it up until interrupted
    Connect {
        /// Path to configuration file
        #[arg(short, long, default_value = "tunkeep.toml")]
        config: PathBuf,

        /// Print the diagnostic log buffer on exit
        #[arg(long)]
        dump_logs: bool,
    },

    /// Report whether this process may create tunnel interfaces
    CheckPermission,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tunkeep.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Connect { config, dump_logs } => run_connect(config, dump_logs).await,
        Commands::CheckPermission => check_permission(),
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_connect(config_path: PathBuf, dump_logs: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let engine_config = config.engine_config()?;
    let document = std::fs::read(&engine_config.config_path).with_context(|| {
        format!(
            "Failed to read engine configuration from {:?}",
            engine_config.config_path
        )
    })?;
    let label = engine_config.server_label.clone();

    let platform = SystemTunPlatform::new().with_fwmark(config.interface.fwmark);
    let tunnel = platform.clone();
    let session_name = config.interface.session_name.clone();
    let watcher = RouteWatcher::start(&Handle::current(), DEFAULT_POLL_INTERVAL, move |name| {
        name == session_name || tunnel.owns_interface(name)
    });
    let settings = ProcessSettings::from_config(&config)?;

    let controller = TunnelController::builder()
        .engine(Arc::new(ProcessEngine::new(settings)))
        .platform(Arc::new(platform))
        .network_watcher(Arc::new(watcher))
        .settings(config.controller_settings()?)
        .build()
        .context("Failed to create tunnel controller")?;

    let (observer, mut events) = ChannelObserver::new();
    controller.attach_observer(Arc::new(observer));

    controller
        .connect(document, &label)
        .context("Failed to start connection")?;

    let closed_by_tunnel = tokio::select! {
        _ = print_until_disconnected(&mut events) => true,
        _ = wait_for_shutdown() => false,
    };

    if closed_by_tunnel {
        info!("Tunnel closed");
    } else {
        info!("Shutting down...");
        controller.disconnect();

        let finished =
            tokio::time::timeout(SHUTDOWN_TIMEOUT, print_until_disconnected(&mut events)).await;
        if finished.is_err() {
            warn!("Tunnel did not report disconnected within {:?}", SHUTDOWN_TIMEOUT);
        }
    }

    if dump_logs {
        for line in controller.get_logs() {
            println!("{}", line);
        }
    }

    match controller.get_last_error() {
        Some(error) if controller.state() == TunnelState::Error => {
            anyhow::bail!("Tunnel failed: {}", error)
        }
        _ => Ok(()),
    }
}

/// Print status events until the tunnel is down for good
async fn print_until_disconnected(events: &mut mpsc::UnboundedReceiver<StatusEvent>) {
    while let Some(event) = events.recv().await {
        match event.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Failed to encode status event: {}", e),
        }

        if matches!(event.status, TunnelState::Disconnected | TunnelState::Error) {
            return;
        }
    }
}

fn check_permission() -> Result<()> {
    use keep_tun::TunPlatform;

    if SystemTunPlatform::new().has_permission() {
        println!("Tunnel permission granted");
        Ok(())
    } else {
        anyhow::bail!("Tunnel permission denied: run as root or grant CAP_NET_ADMIN")
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nSet [engine] command and config_path before connecting.");

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let (mut sigterm, mut sigint) = match (
            signal::unix::signal(signal::unix::SignalKind::terminate()),
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to register signal handlers: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }
}
