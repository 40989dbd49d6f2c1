//! ---
//! flk_section: "05-networking-external-interfaces"
//! flk_subsection: "binary"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Command-line tool driving the fleet driver from captures."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flock_common::logging::init_tracing;
use flock_common::{AppConfig, IdFormat};
use flock_driver::{
    DriverCollaborators, DriverMetrics, FleetDriver, InMemoryDeviceTree, InMemoryPacketSink,
    InMemoryVehicleRegistry, VehicleRegistry,
};
use prometheus::{Registry, TextEncoder};
use serde_json::json;
use tracing::info;

mod replay;

#[derive(Debug, Parser)]
#[command(author, version, about = "FlockLink fleet driver tool", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Load and validate the configuration, then print it")]
    CheckConfig,
    #[command(about = "Print the vehicle ids the driver would assign")]
    FormatId {
        #[arg(required = true, help = "Numeric fleet indices")]
        indices: Vec<u32>,
        #[arg(long, help = "Override the configured id format")]
        format: Option<IdFormat>,
    },
    #[command(about = "Replay a JSONL packet capture through an in-memory driver")]
    Replay {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, help = "Print Prometheus metrics after the replay")]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/flockd.toml"));

    let loaded = match AppConfig::load_with_source(&candidates) {
        Ok(loaded) => Some(loaded),
        Err(err) if cli.config.is_none() => {
            eprintln!("using built-in defaults: {err:#}");
            None
        }
        Err(err) => return Err(err),
    };
    let config_source = loaded.as_ref().map(|l| l.source.display().to_string());
    let config = loaded.map(|l| l.config).unwrap_or_default();

    match cli.command {
        Commands::CheckConfig => {
            config.validate()?;
            let report = json!({
                "source": config_source,
                "config": config,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::FormatId { indices, format } => {
            let format = format.unwrap_or_else(|| config.driver.id_format.clone());
            for index in indices {
                println!(
                    "{index}\t{}",
                    flock_common::make_valid_vehicle_id(&format.format(index))
                );
            }
        }
        Commands::Replay { file, metrics } => {
            init_tracing("flockd", &config.logging)?;
            info!(config_source = config_source.as_deref().unwrap_or("defaults"), capture = %file.display(), "starting replay");
            run_replay(&config, &file, metrics).await?;
        }
    }
    Ok(())
}

async fn run_replay(config: &AppConfig, file: &Path, print_metrics: bool) -> Result<()> {
    let registry = Registry::new();
    let vehicles = Arc::new(InMemoryVehicleRegistry::new());
    let tree = Arc::new(InMemoryDeviceTree::new());
    let sink = InMemoryPacketSink::new();

    let mut driver = FleetDriver::new(
        config,
        DriverCollaborators {
            vehicles: vehicles.clone(),
            device_tree: tree.clone(),
            sink: Arc::new(sink.clone()),
        },
    );
    if config.metrics.enabled {
        driver = driver.with_metrics(
            DriverMetrics::register(&registry).context("failed to register driver metrics")?,
        );
    }
    let driver = Arc::new(driver);

    let summary = replay::replay_file(driver.clone(), file).await?;

    let mut fleet = BTreeMap::new();
    for id in vehicles.ids() {
        if let Some(vehicle) = vehicles.find(&id) {
            fleet.insert(
                id.clone(),
                json!({
                    "status": vehicle.status(),
                    "addresses": driver.addresses().addresses_of(&id),
                }),
            );
        }
    }
    let report = json!({
        "summary": summary,
        "vehicles": fleet,
        "channels": tree.snapshot(),
        "sent_commands": sink.sent_commands(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if print_metrics {
        let text = TextEncoder::new()
            .encode_to_string(&registry.gather())
            .context("failed to encode metrics")?;
        print!("{text}");
    }
    Ok(())
}
