//! Fabric Poller
//!
//! Runs one messaging service against the in-memory fabric: seeds every
//! partition, drains what the scheduler delivers and prints the final
//! statistics as JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use fabric_poller::config::{EngineConfig, LoggingConfig};
use fabric_poller::manual_fabric::{ManualClientFactory, ManualFabric};
use fabric_poller::telemetry::init_tracing;
use fabric_poller::{MessagingService, MessagingServiceConfig, PriorityPartition};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file; a three-partition demo channel when omitted
    #[arg(short, long, env = "FABRIC_POLLER_CONFIG")]
    config: Option<String>,

    /// Messages seeded on every partition
    #[arg(short, long, default_value = "100")]
    messages: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Give up after this many seconds even if messages remain
    #[arg(long, default_value = "30")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => demo_config(),
    };
    config.validate().context("Invalid configuration")?;

    let filter = if args.verbose {
        "fabric_poller=debug,info".to_string()
    } else {
        config.logging.filter.clone()
    };
    init_tracing(&filter, args.json || config.logging.json)?;

    info!("Starting fabric poller v{}", env!("CARGO_PKG_VERSION"));

    let channel_id = config.service.channel_id.clone();
    let partitions = config.service.partitions.clone();

    let fabric = Arc::new(ManualFabric::with_long_poll());
    for partition in &partitions {
        fabric.enqueue_many(&channel_id, partition.priority, args.messages);
    }
    let expected = args.messages * partitions.len();
    info!(channel = %channel_id, partitions = partitions.len(), expected, "Fabric seeded");

    let factory = Arc::new(ManualClientFactory::new(Arc::clone(&fabric)));
    let (service, mut receiver) = MessagingService::new(config.service, factory);
    service.start().await.context("Failed to start messaging service")?;

    let deadline = tokio::time::sleep(Duration::from_secs(args.timeout_secs));
    tokio::pin!(deadline);

    let mut received = 0usize;
    while received < expected {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(_) => received += 1,
                None => break,
            },
            _ = &mut deadline => {
                warn!(received, expected, "Timed out waiting for messages");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let statistics = service.statistics();
    service.stop().await.context("Failed to stop messaging service")?;

    info!(received, expected, "Messaging service finished");
    println!("{}", statistics.to_json()?);

    Ok(())
}

fn demo_config() -> EngineConfig {
    let partitions = vec![
        PriorityPartition::new(0, dec!(0.5)),
        PriorityPartition::new(1, Decimal::ONE),
        PriorityPartition::new(2, dec!(2)),
    ];
    EngineConfig {
        service: MessagingServiceConfig::new("demo", partitions),
        logging: LoggingConfig::default(),
    }
}
