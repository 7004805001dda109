//! meshprov-device - simulated unprovisioned device for the TCP test bearer.

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use meshprov_core::{InputOobAction, OutputOobAction, ProvisioningError, ProvisioningResult};
use meshprov_device::{DeviceConfig, DeviceServer};

#[derive(Debug, Parser)]
#[command(name = "meshprov-device", version, about = "Simulated unprovisioned Mesh device")]
struct Cli {
    /// JSON config file
    #[arg(long, env = "MESHPROV_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Device UUID (overrides the config file)
    #[arg(long)]
    uuid: Option<Uuid>,

    /// Advertise static OOB with this 32-digit hex value
    #[arg(long)]
    static_oob: Option<String>,

    /// Log filter, e.g. "info" or "meshprov_device=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Show an output OOB value on the console.
fn show_output(action: OutputOobAction, value: &str) {
    match action {
        OutputOobAction::Blink | OutputOobAction::Beep | OutputOobAction::Vibrate => {
            eprintln!(">>> device {action:?} x{value}");
        }
        OutputOobAction::OutputNumeric | OutputOobAction::OutputAlphanumeric => {
            eprintln!(">>> device displays: {value}");
        }
    }
}

/// Read the value shown by the provisioner from stdin.
fn read_input(action: InputOobAction, size: u8) -> ProvisioningResult<String> {
    eprintln!(">>> enter the value shown by the provisioner ({action:?}, size {size}):");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| ProvisioningError::InvalidInput(format!("stdin: {}", e)))?;
    Ok(line.trim().to_string())
}

#[tokio::main]
async fn main() -> ProvisioningResult<()> {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();

    let mut config = match &cli.config {
        Some(path) => DeviceConfig::from_json_file(path)?,
        None => DeviceConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(uuid) = cli.uuid {
        config = config.with_uuid(uuid);
    }
    if let Some(value) = cli.static_oob {
        config = config.with_static_oob(value);
    }

    let registry = config.registry(show_output, read_input)?;
    tracing::info!(capabilities = ?registry.capabilities(), "starting device");

    let server = DeviceServer::new(config, registry)?;
    server.run().await
}
