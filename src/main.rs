//! Rule-based traffic tunnel.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────────┐
//!                    │                       RULE TUNNEL                         │
//!                    │                                                           │
//!   Client           │  ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌─────────┐  │
//!   ─────────────────┼─▶│ inbound  │──▶│  tunnel  │──▶│  rules  │──▶│ adapter │──┼──▶ Upstream
//!                    │  │listeners │   │dispatcher│   │  match  │   │ proxies │  │
//!                    │  └──────────┘   └────┬─────┘   └─────────┘   └────┬────┘  │
//!                    │                      │                            │       │
//!                    │                      ▼                            ▼       │
//!                    │                ┌───────────┐            ┌─────────────┐   │
//!                    │                │ statistic │            │  health +   │   │
//!                    │                │ registry  │            │  provider   │   │
//!                    │                └───────────┘            └─────────────┘   │
//!                    │                                                           │
//!                    │  ┌─────────────────────────────────────────────────────┐  │
//!                    │  │  engine: config reload, selection cache, reporting  │  │
//!                    │  └─────────────────────────────────────────────────────┘  │
//!                    └──────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use rule_tunnel::config::{load_config, ConfigWatcher};
use rule_tunnel::lifecycle::{wait_for_signal, Signal};
use rule_tunnel::observability::{logging, metrics};
use rule_tunnel::{Engine, EngineOptions};

#[derive(Parser)]
#[command(name = "rule-tunnel")]
#[command(about = "Rule-based traffic tunnel", long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short = 'f', long = "config", env = "RULE_TUNNEL_CONFIG_FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Directory for provider files and the selection cache; defaults to the
    /// config file's directory.
    #[arg(short = 'd', long = "home-dir", env = "RULE_TUNNEL_HOME_DIR")]
    home_dir: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Apply config file changes as they are saved.
    #[arg(long)]
    watch: bool,
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = absolute(&cli.config)?;
    let home_dir = match &cli.home_dir {
        Some(dir) => absolute(dir)?,
        None => config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(std::env::current_dir()?),
    };

    let config = load_config(&config_path)?;
    if cli.test {
        println!("configuration file {} test is successful", config_path.display());
        return Ok(());
    }

    let log = logging::init(config.log_level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        home_dir = %home_dir.display(),
        "rule-tunnel starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let options = EngineOptions::new(home_dir)
        .with_config_path(config_path.clone())
        .with_log(log);
    let engine = Arc::new(Engine::start(config, options).await?);

    // Kept alive for the lifetime of the process when watching.
    let _watcher = if cli.watch {
        let (watcher, mut updates) = ConfigWatcher::new(&config_path);
        let handle = watcher.run()?;
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                if let Err(e) = engine.apply_config(config, false).await {
                    tracing::error!(error = %e, "Watched config not applied");
                }
            }
        });
        Some(handle)
    } else {
        None
    };

    loop {
        match wait_for_signal().await? {
            Signal::Reload => {
                if let Err(e) = engine.update_config_from_path(None, true).await {
                    tracing::error!(error = %e, "Reload failed, keeping current configuration");
                }
            }
            Signal::Shutdown => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}
