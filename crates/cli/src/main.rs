//! KPI threshold automation CLI
//!
//! Resets or configures the thresholds of ITSI service KPIs from the
//! command line.

mod catalog;
mod client;
mod commands;
mod config;
mod output;
mod search;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::threshold::{self, ThresholdCommands};
use config::{Config, ConfigOverrides};
use output::{print_fatal, LogFormat};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// KPI threshold automation CLI
#[derive(Parser)]
#[command(name = "kpictl")]
#[command(author, version, about = "KPI threshold automation for ITSI services", long_about = None)]
pub struct Cli {
    /// Path to a YAML config file (default: ~/.kpictl.yaml)
    #[arg(long, env = "KPICTL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Upper bound on concurrent network calls
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Platform management host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Platform management port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Bearer token, used instead of user/password when set
    #[arg(long, global = true)]
    pub access_token: Option<String>,

    #[arg(long, global = true)]
    pub user: Option<String>,

    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage KPI thresholds
    #[command(subcommand, visible_alias = "thld")]
    Threshold(ThresholdCommands),
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_file: self.config.clone(),
            verbose: self.verbose,
            concurrency: self.concurrency,
            host: self.host.clone(),
            port: self.port,
            insecure: self.insecure,
            access_token: self.access_token.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.overrides())?;
    init_tracing(config.verbose, cli.log_format);
    if config.verbose {
        config.log_effective();
    }

    let result = match cli.command {
        Commands::Threshold(command) => threshold::run(command, &config).await,
    };

    if let Err(e) = result {
        print_fatal(&e);
        std::process::exit(1);
    }

    Ok(())
}
