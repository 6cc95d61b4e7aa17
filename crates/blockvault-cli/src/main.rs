//! Blockvault command-line interface: converge, create, delete and inspect encrypted devices.

use anyhow::{anyhow, Context, Result};
use blockvault_core::{
    logging,
    workflow::{self, WorkflowLevel, WorkflowReport},
    BlockDeviceService, BlockvaultConfig, Crypttab, DeleteOptions, DeviceCfg, FileSecretStore,
    MappingState,
};
use blockvault_cryptsetup::{SystemCipherEngine, SystemHost};
use clap::{Parser, Subcommand};
use log::warn;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "/etc/blockvault.toml";

type SystemService = BlockDeviceService<SystemCipherEngine, SystemHost, FileSecretStore>;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "blockvault",
    version,
    about = "Lifecycle management for dm-crypt encrypted block devices."
)]
struct Cli {
    /// Path to the Blockvault configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring every declared device to its `ensure` state.
    Apply,

    /// Create and activate one declared device.
    Create {
        /// Device name as declared in `[[devices]]`.
        name: String,
    },

    /// Close and remove one declared device.
    Delete {
        /// Device name as declared in `[[devices]]`.
        name: String,

        /// Remove the cryptsetup packages when no table rows remain.
        #[arg(long)]
        uninstall_if_last: bool,
    },

    /// Show the mapping state of one device (or all declared devices).
    Status {
        /// Device name; defaults to every declared device.
        name: Option<String>,
    },

    /// List the rows of the mapping table with their current state.
    List,

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(BlockvaultConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let cfg = load_config(&file)?;
            let issues = cfg.validate();
            if issues.is_empty() {
                println!("Configuration valid ({} devices).", cfg.devices.len());
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
        }
        Commands::Apply => {
            let (config, service) = build_service(&cli.config)?;
            let report = workflow::converge(&config, &service).map_err(anyhow::Error::new)?;
            print_report(report);
        }
        Commands::Create { name } => {
            let (config, service) = build_service(&cli.config)?;
            let spec = declared(&config, &name)?
                .to_spec()
                .with_context(|| format!("device `{name}` is misconfigured"))?;
            let created = service
                .create(&spec)
                .with_context(|| format!("failed to create `{name}`"))?;
            print_report(WorkflowReport {
                title: format!("Create {name}"),
                events: workflow::create_events(&created),
            });
        }
        Commands::Delete {
            name,
            uninstall_if_last,
        } => {
            let (config, service) = build_service(&cli.config)?;
            let spec = declared(&config, &name)?
                .to_spec()
                .with_context(|| format!("device `{name}` is misconfigured"))?;
            let mut options = DeleteOptions::from_config(&config);
            options.uninstall_if_last |= uninstall_if_last;
            let deleted = service
                .delete(&spec, options)
                .with_context(|| format!("failed to delete `{name}`"))?;
            if deleted.decommissioned {
                warn!(
                    "cryptsetup packages removed after deleting {name}: {}",
                    config.lifecycle.packages.join(", ")
                );
            }
            print_report(WorkflowReport {
                title: format!("Delete {name}"),
                events: workflow::delete_events(&deleted),
            });
        }
        Commands::Status { name } => {
            let (_config, service) = build_service(&cli.config)?;
            let statuses = match name {
                Some(name) => vec![service.status(&name)?],
                None => service.list_declared()?,
            };
            print_report(WorkflowReport {
                title: format!("Status of {} device(s)", statuses.len()),
                events: statuses.iter().map(workflow::status_event).collect(),
            });
        }
        Commands::List => {
            let (config, service) = build_service(&cli.config)?;
            let table = Crypttab::new(config.crypttab_path());
            let entries = table
                .entries()
                .with_context(|| format!("failed to read {}", table.path().display()))?;
            println!("{:<24} {:<32} {:<10} {}", "NAME", "DEVICE", "STATE", "KEY");
            for entry in entries {
                let state = match service.status(&entry.name)?.state {
                    MappingState::Active => "active".to_string(),
                    MappingState::Inactive => "inactive".to_string(),
                    MappingState::Unknown(detail) => detail,
                };
                println!(
                    "{:<24} {:<32} {:<10} {}",
                    entry.name, entry.device, state, entry.key_source
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<BlockvaultConfig> {
    BlockvaultConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn build_service(path: &Path) -> Result<(Arc<BlockvaultConfig>, SystemService)> {
    let config = Arc::new(load_config(path)?);
    let engine = SystemCipherEngine::from_config(&config)?;
    let host = SystemHost::from_config(&config);
    let store = FileSecretStore::from(config.as_ref());
    let service = BlockDeviceService::new(config.clone(), engine, host, store);
    Ok((config, service))
}

fn declared<'a>(config: &'a BlockvaultConfig, name: &str) -> Result<&'a DeviceCfg> {
    config
        .device(name)
        .ok_or_else(|| anyhow!("device `{name}` is not declared in {}", config.path.display()))
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
