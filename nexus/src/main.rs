//! Nexus CLI - run the message bus and agent orchestrator.
//!
//! # Usage
//!
//! ```bash
//! # Start the bus with the agents listed in the config file
//! nexus run
//!
//! # Ping the built-in Solomon echo agent end to end
//! nexus demo
//!
//! # Configuration management
//! nexus config init
//! nexus config show
//! nexus config validate --config ./nexus.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use nexus::agents::TaskReply;
use nexus::config::{LogFormat, NexusConfig};
use nexus::{
    AgentId, AgentOrchestrator, AgentSpec, BuiltinLauncher, Message, MessageBus, MessageKind,
};

#[derive(Parser)]
#[command(name = "nexus")]
#[command(about = "Nexus - message bus and agent orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $NEXUS_CONFIG_PATH or ~/.nexus/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bus and orchestrator with the configured agents
    Run {
        /// Seconds between metrics log lines
        #[arg(long, default_value = "30")]
        metrics_interval: u64,
    },

    /// Send "ping" to the Solomon echo agent and print the reply
    Demo {
        /// Reply deadline in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Load and validate the configuration
    Validate,

    /// Write a sample configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config(ConfigCommands::Init { force }) = &cli.command {
        init_logging("info", LogFormat::Text, cli.verbose);
        return config_init(cli.config, *force).await;
    }

    let config = NexusConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    init_logging(&config.logging.level, config.logging.format, cli.verbose);

    match cli.command {
        Commands::Run { metrics_interval } => {
            serve(config, Duration::from_secs(metrics_interval.max(1))).await
        }
        Commands::Demo { timeout_ms } => demo(config, Duration::from_millis(timeout_ms)).await,
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Validate) => {
            println!("Configuration is valid ({} agents)", config.agents.len());
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { .. }) => Ok(()),
    }
}

async fn start_runtime(config: &NexusConfig) -> Result<(MessageBus, AgentOrchestrator)> {
    let log = config
        .log
        .open()
        .await
        .context("Failed to open message log")?;
    let bus = MessageBus::new(config.bus.to_bus_config(), log);
    bus.start();

    let orchestrator = AgentOrchestrator::new(
        bus.clone(),
        Arc::new(BuiltinLauncher::new()),
        config.orchestrator.to_orchestrator_config(),
    );
    orchestrator.start();
    Ok((bus, orchestrator))
}

async fn stop_runtime(bus: MessageBus, orchestrator: AgentOrchestrator) {
    orchestrator.shutdown().await;
    bus.shutdown().await;
}

async fn serve(config: NexusConfig, metrics_interval: Duration) -> Result<()> {
    let (bus, orchestrator) = start_runtime(&config).await?;

    for spec in &config.agents {
        orchestrator
            .spawn_agent(spec.clone())
            .with_context(|| format!("Failed to start agent {}", spec.id))?;
    }
    info!("Nexus running with {} agents, press Ctrl-C to stop", config.agents.len());

    let mut ticker = tokio::time::interval(metrics_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = ticker.tick() => {
                let metrics = bus.metrics();
                info!(
                    published = metrics.published,
                    delivered = metrics.delivered,
                    retried = metrics.retried,
                    dead_lettered = metrics.dead_lettered,
                    pending_correlations = bus.pending_correlations(),
                    "bus metrics"
                );
            }
        }
    }

    info!("Shutting down");
    stop_runtime(bus, orchestrator).await;
    Ok(())
}

async fn demo(config: NexusConfig, timeout: Duration) -> Result<()> {
    let (bus, orchestrator) = start_runtime(&config).await?;

    let solomon = AgentId::from("solomon");
    if orchestrator.agent(&solomon).is_none() {
        let spec = config
            .agents
            .iter()
            .find(|spec| spec.id == solomon)
            .cloned()
            .unwrap_or_else(|| {
                AgentSpec::new("solomon", "echo")
                    .with_topic("agents.solomon")
                    .with_settings(serde_json::json!({ "replies": { "ping": "pong" } }))
            });
        orchestrator.spawn_agent(spec)?;
    }

    let request = Message::builder("demo-client")
        .kind(MessageKind::Request)
        .recipient(solomon)
        .payload(serde_json::json!("ping"))
        .build();
    let outcome = bus.publish_and_wait(request, timeout).await;

    let metrics = bus.metrics();
    let report = match &outcome {
        Ok(reply) => match TaskReply::from_message(reply) {
            TaskReply::Ok { result } => serde_json::json!({ "reply": result, "metrics": metrics }),
            TaskReply::Error { message } => {
                serde_json::json!({ "error": message, "metrics": metrics })
            }
        },
        Err(e) => serde_json::json!({ "error": e.to_string(), "metrics": metrics }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    stop_runtime(bus, orchestrator).await;
    outcome.map(|_| ()).context("Demo request failed")
}

async fn config_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => NexusConfig::config_path()?,
    };
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    NexusConfig::sample()
        .save_to_path(&path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Initialize tracing
fn init_logging(level: &str, format: LogFormat, verbose: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new("nexus=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("nexus={level},warn")))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
