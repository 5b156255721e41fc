//! Node Controller - Remote hardware control over a message bus
//!
//! Runs the node agent or issues single control requests to a node.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_controller::backend::{CapabilityBackend, SimulatedBackend, SysfsBackend};
use node_controller::bus::{MessageBus, NatsBus};
use node_controller::config::{self, BackendKind, Config};
use node_controller::control::{ControlClient, ControlServer, ControlTarget, Dispatcher, ServerEvent};
use node_controller::topology::{SysfsTopology, TopologyProvider};

/// Node Controller - remote hardware control over NATS
#[derive(Parser)]
#[command(name = "node-controller")]
#[command(author = "Node Controller Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Read and write hardware controls on cluster nodes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write log output to this file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent until interrupted
    Serve,

    /// Show the CPU topology of a node
    Topology {
        /// Target node
        #[arg(long)]
        host: String,
    },

    /// List the controls a node offers
    List {
        /// Target node
        #[arg(long)]
        host: String,
    },

    /// Read a control: <name>@<type>[-<type-id>]
    Get {
        /// Target node
        #[arg(long)]
        host: String,

        /// Control and device, e.g. rapl.pkg_limit_1@socket-0
        target: ControlTarget,
    },

    /// Write a control: <name>@<type>[-<type-id>]=<value>
    Set {
        /// Target node
        #[arg(long)]
        host: String,

        /// Control, device and value, e.g. rapl.pkg_limit_1@socket-0=200000000
        target: ControlTarget,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    init_logging(cli.verbose || config.log.debug, cli.log.as_ref().or(config.log.file.as_ref()))?;

    match cli.command {
        Commands::Serve => {
            run_server(config).await?;
        }
        Commands::Topology { host } => {
            let topology = client(&config).await?.get_topology(&host).await?;
            println!("{}", serde_json::to_string_pretty(&topology)?);
        }
        Commands::List { host } => {
            let list = client(&config).await?.get_controls(&host).await?;
            for control in list.controls {
                println!(
                    "{}.{} for type={} ({}): {}",
                    control.category, control.name, control.device_type, control.methods, control.description
                );
            }
        }
        Commands::Get { host, target } => {
            let value = client(&config)
                .await?
                .get_control_value(&host, &target.name, &target.device_type, target.type_id.as_deref())
                .await
                .with_context(|| format!("Failed to get control {} of node {}", target.name, host))?;
            println!("{}", value);
        }
        Commands::Set { host, target } => {
            let Some(value) = target.value.as_deref() else {
                anyhow::bail!("No value given for {}, expected <name>@<type>-<type-id>=<value>", target);
            };
            client(&config)
                .await?
                .set_control_value(&host, &target.name, &target.device_type, target.type_id.as_deref(), value)
                .await
                .with_context(|| format!("Failed to set control {} of node {}", target.name, host))?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Install the tracing subscriber, writing to stderr or a log file
fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn MessageBus>> {
    let bus = NatsBus::connect(&config.bus).await?;
    Ok(Arc::new(bus))
}

async fn client(config: &Config) -> anyhow::Result<ControlClient> {
    Ok(ControlClient::new(connect(config).await?)
        .with_subject(config.bus.subject.clone())
        .with_timeout(Duration::from_millis(config.client.timeout_ms)))
}

/// Run the node agent
async fn run_server(config: Config) -> anyhow::Result<()> {
    let hostname = config.node.hostname();
    let topology: Arc<dyn TopologyProvider> = Arc::new(SysfsTopology::new(&config.backend.sysfs_root));
    let backend: Arc<dyn CapabilityBackend> = match config.backend.kind {
        BackendKind::Sysfs => Arc::new(SysfsBackend::new(&config.backend.sysfs_root)),
        BackendKind::Simulated => {
            let snapshot = topology
                .snapshot()
                .context("Simulated backend needs the node topology")?;
            Arc::new(SimulatedBackend::new(&snapshot.cpu_info))
        }
    };
    tracing::info!(
        "Starting node controller '{}' with {:?} backend ({} controls)",
        hostname,
        config.backend.kind,
        backend.list().map(|l| l.len()).unwrap_or(0)
    );

    let bus = connect(&config).await?;
    let subject = config.bus.server_subject(&hostname);
    let dispatcher = Dispatcher::new(hostname, backend, topology);
    let mut server = ControlServer::new(dispatcher, bus, subject);

    let mut event_rx = server
        .take_event_receiver()
        .context("Server event receiver already taken")?;

    server.start().await?;

    let terminate = shutdown_signal();
    tokio::pin!(terminate);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::Replied { name, level } => {
                        tracing::debug!("Replied to {} ({})", name, level);
                    }
                    ServerEvent::Dropped { name, reason } => {
                        tracing::debug!("No reply for {}: {}", name, reason);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Stopped => {
                        tracing::warn!("Server loop ended");
                        break;
                    }
                    ServerEvent::Started { .. } => {}
                }
            }
            _ = &mut terminate => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    if server.is_running().await {
        server.stop().await?;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolves on SIGINT or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["node-controller", "serve"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "node-controller",
            "--verbose",
            "set",
            "--host",
            "nodeA",
            "rapl.pkg_limit_1@socket-0=200000000",
        ])
        .unwrap();
        match cli.command {
            Commands::Set { host, target } => {
                assert_eq!(host, "nodeA");
                assert_eq!(target.type_id.as_deref(), Some("0"));
                assert_eq!(target.value.as_deref(), Some("200000000"));
            }
            _ => panic!("expected set"),
        }
        assert!(cli.verbose);

        assert!(Cli::try_parse_from(["node-controller", "get", "--host", "nodeA", "no-at-sign"]).is_err());
    }
}
