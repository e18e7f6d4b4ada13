//! CLADNet Agent
//!
//! Runs the tunneling engine of one host of a Cloud Adaptive Network, and
//! exposes the address recommender and destination policy for operators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use cladnet_core::{
    get_available_ipv4_private_address_spaces, select_destination, HostAgent, NetworkingRule,
    RuleType,
};
use cladnet_network::tun::MemoryInterface;
use config::AgentConfig;

/// CLADNet - Cloud Adaptive Network agent
#[derive(Parser)]
#[command(name = "cladnet-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.cladnet/config.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up the interface and tunnel until interrupted
    Run {
        /// Networking rule JSON (overrides the config file)
        #[arg(short, long)]
        rule: Option<PathBuf>,

        /// Seal packets with peer keys
        #[arg(short, long)]
        encryption: bool,
    },

    /// Show host id, public key and network information
    Info,

    /// Recommend a private address space given CIDRs already in use
    Recommend {
        /// CIDR blocks used by the hosts that will join
        cidrs: Vec<String>,
    },

    /// Show which address a source host would send to for a destination host
    Select {
        /// basic or cost-prioritized
        #[arg(short = 't', long, default_value = "basic")]
        rule_type: String,

        /// Networking rule JSON
        #[arg(short, long)]
        rule: PathBuf,

        /// Source host id
        source: String,

        /// Destination host id
        destination: String,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_path(&cli.config)?;
    let config = AgentConfig::load_or_create(&config_path).await?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .to_lowercase();
    let log_level = match level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Run { rule, encryption } => cmd_run(config, rule, encryption).await,
        Commands::Info => cmd_info(config).await,
        Commands::Recommend { cidrs } => cmd_recommend(&cidrs),
        Commands::Select {
            rule_type,
            rule,
            source,
            destination,
        } => cmd_select(&rule_type, &rule, &source, &destination).await,
        Commands::Config => cmd_config(&config),
    }
}

async fn cmd_run(mut config: AgentConfig, rule: Option<PathBuf>, encryption: bool) -> Result<()> {
    if encryption {
        config.tunnel.encryption = true;
    }
    config.validate()?;

    let rule_path = rule
        .or_else(|| config.rule.path.clone())
        .context("No networking rule given; use --rule or set [rule] path")?;
    let rule = load_rule(&rule_path).await?;

    let interface = cladnet_network::create_interface()?;
    let agent = Arc::new(HostAgent::new(config.tunnel.clone(), interface).await?);

    for (host_id, key) in &config.keyring.peers {
        if let Err(e) = agent.update_keyring(host_id, key) {
            warn!("Skipping keyring entry for {}: {}", host_id, e);
        }
    }

    agent.set_networking_rule(rule).await;

    let mut runner = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run().await })
    };

    agent
        .configure_network_interface()
        .await
        .context("Failed to configure network interface")?;
    info!(
        "Tunneling as {} on port {}",
        agent.host_id(),
        config.tunnel.tunneling_port
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
        result = &mut runner => {
            warn!("Tunneling stopped: {:?}", result);
        }
    }

    agent.close().await?;
    if !runner.is_finished() {
        runner.await??;
    }

    let stats = agent.stats();
    info!(
        "Sent {} packets ({} bytes), received {} packets ({} bytes)",
        stats.packets_sent, stats.bytes_sent, stats.packets_received, stats.bytes_received
    );
    Ok(())
}

async fn cmd_info(config: AgentConfig) -> Result<()> {
    config.validate()?;

    // Discovery only, no OS device is created
    let (interface, _handle) = MemoryInterface::new();
    let agent = HostAgent::new(config.tunnel, interface).await?;

    println!("Host ID:    {}", agent.host_id());
    println!("Public key: {}", agent.public_key_base64());
    println!(
        "{}",
        serde_json::to_string_pretty(&agent.host_network_information())?
    );
    Ok(())
}

fn cmd_recommend(cidrs: &[String]) -> Result<()> {
    let spaces = get_available_ipv4_private_address_spaces(cidrs)?;
    println!("{}", serde_json::to_string_pretty(&spaces)?);
    Ok(())
}

async fn cmd_select(rule_type: &str, rule_path: &Path, source: &str, destination: &str) -> Result<()> {
    let rule_type: RuleType = rule_type.parse()?;
    let rule = load_rule(rule_path).await?;

    let source_peer = rule
        .peer_by_host_id(source)
        .with_context(|| format!("Host {} not in rule", source))?;
    let destination_peer = rule
        .peer_by_host_id(destination)
        .with_context(|| format!("Host {} not in rule", destination))?;

    let address = select_destination(rule_type, source_peer, destination_peer)?;
    println!("{}", address);
    Ok(())
}

fn cmd_config(config: &AgentConfig) -> Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

// Helper functions

async fn load_rule(path: &Path) -> Result<NetworkingRule> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read networking rule {:?}", path))?;
    serde_json::from_str(&contents).context("Failed to parse networking rule")
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}
