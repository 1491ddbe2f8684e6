//! CCU event bridge - main entry point

use anyhow::Context;
use ccu_event_bridge::{
    bridge,
    config::StoreConfig,
    liveness::notifier_from_env,
    logging::{init_logging, LogConfig},
    store::open_store,
    BridgeConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, Level};

/// CCU event bridge configuration
#[derive(Parser, Debug)]
#[command(name = "ccu-event-bridge")]
#[command(about = "Persist HomeMatic CCU device events received over XML-RPC")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file; environment keys are used when absent
    #[arg(long, short, global = true, env = "CCU_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Also log to this file (rotated daily)
    #[arg(long, global = true, env = "CCU_BRIDGE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Override the configured state store
    #[arg(long, global = true, value_enum)]
    store: Option<StoreKind>,
}

#[derive(Subcommand, Debug, Default)]
enum Command {
    /// Subscribe and serve callbacks until interrupted
    #[default]
    Run,
    /// Validate the configuration and print it
    Check,
    /// Print all stored device values as JSON lines
    Dump,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StoreKind {
    Sqlite,
    Memory,
}

impl Cli {
    fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::from_env();
        if self.debug {
            config.level = Level::DEBUG;
        }
        if let Some(path) = &self.log_file {
            config.file_path = Some(path.clone());
        }
        config.json |= self.log_json;
        config
    }

    fn load_config(&self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BridgeConfig::from_env().context("loading configuration from environment")?,
        };

        match self.store {
            Some(StoreKind::Memory) => config.store = StoreConfig::Memory,
            Some(StoreKind::Sqlite) if config.store == StoreConfig::Memory => {
                config.store = StoreConfig::default()
            }
            _ => {}
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_config())?;

    let config = cli.load_config()?;

    match cli.command.unwrap_or_default() {
        Command::Run => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                interfaces = config.interfaces.len(),
                devices = config.filter.devices.len(),
                "Starting CCU event bridge"
            );
            bridge::run(config, notifier_from_env()).await?;
        }
        Command::Check => {
            let mut shown = config;
            for credentials in [shown.ccu.credentials.as_mut(), shown.server.auth.as_mut()]
                .into_iter()
                .flatten()
            {
                credentials.password = "***".to_string();
            }
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        Command::Dump => {
            let store = open_store(&config.store).await?;
            for record in store.list().await? {
                let line = serde_json::json!({
                    "device_id": record.device_id,
                    "param": record.parameter,
                    "interface": record.interface,
                    "value": record.value.to_string(),
                    "value_type": record.value.kind().map(|k| k.as_str()),
                    "last_updated": record.last_updated.to_rfc3339(),
                });
                println!("{line}");
            }
        }
    }

    Ok(())
}
