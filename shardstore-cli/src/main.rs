use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shardstore::{DeviceConfig, LocalObjectStore, StorageDevice, DEFAULT_CONTENT_TYPE};

mod metrics;

use metrics::PrometheusMetrics;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    #[arg(long, global = true, help = "Device configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long, global = true, help = "Key root, overrides the configuration file")]
    root: Option<String>,

    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var"
    )]
    log_level: String,

    #[arg(long, global = true, help = "Print Prometheus counters when done")]
    print_metrics: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the sharded key of a file name
    Path { name: String },

    /// Upload a local file
    Put {
        source: PathBuf,
        name: String,

        #[arg(long, default_value = DEFAULT_CONTENT_TYPE)]
        content_type: String,
    },

    /// Download a file
    Get { name: String, dest: PathBuf },

    /// Show size, content type and hash of a file
    Stat { name: String },

    /// Move a file to a new name
    Mv { from: String, to: String },

    /// Delete a file
    Rm { name: String },

    /// Delete every object whose key starts with the given prefix
    RmPath { prefix: String },

    /// Show space figures (-1 when the backend has no such notion)
    Df,
}

fn setup_tracing(log_level: &str) {
    // Try to use RUST_LOG env var first, fall back to CLI flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    setup_tracing(&cli.device.log_level);

    run(cli)
}

fn load_config(args: &DeviceArgs) -> Result<DeviceConfig> {
    let mut config = match &args.config {
        Some(path) => DeviceConfig::load_from_file(path)?,
        None => DeviceConfig::default(),
    };
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.device)?;
    info!(root = %config.root, data_dir = %cli.device.data_dir.display(), "opening device");

    let store = LocalObjectStore::open(&cli.device.data_dir)
        .await?
        .with_min_part_size(config.min_part_size);

    let metrics = if cli.device.print_metrics {
        Some(PrometheusMetrics::new()?)
    } else {
        None
    };
    let device = match &metrics {
        Some(metrics) => {
            StorageDevice::with_metrics(config, Arc::new(store), metrics.to_device_metrics())?
        }
        None => StorageDevice::new(config, Arc::new(store))?,
    };

    match cli.command {
        Command::Path { name } => {
            println!("{}", device.get_path(&name)?);
        }
        Command::Put {
            source,
            name,
            content_type,
        } => {
            let key = device.get_path(&name)?;
            device.upload_file(&source, &key, &content_type).await?;
            info!(source = %source.display(), key, "stored file");
            println!("{key}");
        }
        Command::Get { name, dest } => {
            let key = device.get_path(&name)?;
            let data = device.read(&key).await?;
            tokio::fs::write(&dest, &data).await?;
            info!(key, dest = %dest.display(), size = data.len(), "retrieved file");
        }
        Command::Stat { name } => {
            let key = device.get_path(&name)?;
            let head = device.stat(&key).await?;
            let stat = serde_json::json!({
                "key": key,
                "size": head.size,
                "mime_type": head.mime_type,
                "hash": head.hash,
                "last_modified": head.last_modified.map(|t| t.to_rfc3339()),
            });
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Command::Mv { from, to } => {
            let source = device.get_path(&from)?;
            let destination = device.get_path(&to)?;
            device.move_object(&source, &destination).await?;
            println!("{destination}");
        }
        Command::Rm { name } => {
            let key = device.get_path(&name)?;
            device.delete(&key).await?;
        }
        Command::RmPath { prefix } => {
            device.delete_path(&prefix).await?;
        }
        Command::Df => {
            println!("Directory size: {}", device.get_directory_size(device.root()));
            println!("Partition free space: {}", device.get_partition_free_space());
            println!("Partition total space: {}", device.get_partition_total_space());
        }
    }

    if metrics.is_some() {
        print!("{}", PrometheusMetrics::gather_text()?);
    }
    Ok(())
}
