//! # Command Line Interface
//!
//! `compile` runs one build pass over a resource snapshot file and prints the
//! resulting statuses and xDS resource names. `check-config` validates the
//! process configuration.

pub mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::dag::{Builder, ResourceSnapshot};
use crate::observability::{init_logging, log_config_info};
use crate::xds::XdsState;
use output::{print_json, print_report, CacheLine, CompileReport, OutputFormat, StatusLine};

#[derive(Parser)]
#[command(name = "ingressplane")]
#[command(about = "Envoy ingress control plane tooling")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a resource snapshot and print statuses and xDS resources
    Compile {
        /// Snapshot file with routing resources, services and secrets
        #[arg(short, long)]
        resources: PathBuf,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Exit with an error when any routing resource is invalid
        #[arg(long)]
        strict: bool,
    },

    /// Validate configuration and print the effective settings
    CheckConfig {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

/// Load configuration: defaults, then the optional file, then environment.
pub fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let base = match path {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::default(),
    };
    let config = base.with_env_overrides()?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Run one build pass and collect what it produced.
pub fn compile(config: &AppConfig, snapshot: &ResourceSnapshot) -> Result<CompileReport> {
    let state = XdsState::new(
        Builder::new(config.builder_config()?),
        config.listener_config().context("Failed to assemble listener settings")?,
    );
    let summary = state.rebuild(snapshot);
    let caches = state.caches();

    Ok(CompileReport {
        statuses: summary.statuses.values().map(StatusLine::from).collect(),
        resources: vec![
            CacheLine::from_cache(&caches.listeners),
            CacheLine::from_cache(&caches.routes),
            CacheLine::from_cache(&caches.clusters),
            CacheLine::from_cache(&caches.secrets),
        ],
    })
}

/// Run CLI commands
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    if cli.verbose {
        config.observability.log_level = "debug".to_string();
    }
    init_logging(&config.observability);

    match cli.command {
        Commands::Compile { resources, format, strict } => {
            let snapshot = ResourceSnapshot::from_file(&resources)?;
            if snapshot.is_empty() {
                tracing::warn!(path = %resources.display(), "Resource snapshot is empty");
            }
            let report = compile(&config, &snapshot)?;
            print_report(&report, format)?;
            let invalid = report.invalid_count();
            if strict && invalid > 0 {
                anyhow::bail!("{invalid} routing resource(s) are invalid");
            }
        }
        Commands::CheckConfig { format } => {
            config.listener_config().context("Failed to assemble listener settings")?;
            match format {
                OutputFormat::Json => print_json(&config)?,
                OutputFormat::Text => {
                    log_config_info(&config);
                    println!("configuration is valid");
                }
            }
        }
    }

    Ok(())
}
