//! Provision a device served over the TCP test bearer.
//!
//! Prints the resulting node record as JSON on stdout; logs go to stderr.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use meshprov_core::{
    AuthMethod, AuthSelection, Capabilities, InputOobAction, OutputOobAction, ProvisioningData,
    ProvisioningError, ProvisioningResult, TracingObserver,
};
use meshprov_provisioner::{
    AuthenticationHandler, BearerConfig, Provisioner, ProvisionerConfig,
};

/// Bluetooth Mesh provisioner.
#[derive(Parser, Debug)]
#[command(name = "meshprov-provision", about = "Provision a Bluetooth Mesh device", version)]
struct Cli {
    /// Device bearer address.
    #[arg(long, env = "MESHPROV_DEVICE", default_value = "127.0.0.1:9000")]
    device: SocketAddr,

    /// Device UUID from its unprovisioned beacon.
    #[arg(long, env = "MESHPROV_DEVICE_UUID")]
    uuid: Option<Uuid>,

    /// Hex-encoded 16-byte network key.
    #[arg(long, env = "MESHPROV_NET_KEY")]
    net_key: String,

    /// Network key index (12 bits).
    #[arg(long, default_value_t = 0, value_parser = parse_u16)]
    key_index: u16,

    /// Unicast address for the primary element, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_u16)]
    unicast: u16,

    /// IV index.
    #[arg(long, default_value_t = 0)]
    iv_index: u32,

    /// Key refresh / IV update flags.
    #[arg(long, default_value_t = 0)]
    flags: u8,

    /// Authentication method: none, static, output or input.
    #[arg(long, default_value = "none")]
    auth: AuthMethod,

    /// Hex-encoded static OOB value.
    #[arg(long, env = "MESHPROV_STATIC_OOB")]
    static_oob: Option<String>,

    /// Attention timer in seconds.
    #[arg(long, default_value_t = 5)]
    attention: u8,

    /// Seconds to wait for each device PDU.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, env = "MESHPROV_LOG", default_value = "info")]
    log_level: String,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("'{s}': {e}"))
}

/// Method chosen on the command line; output values are read from stdin.
struct CliAuthentication {
    method: AuthMethod,
    static_oob: Option<String>,
}

#[async_trait]
impl AuthenticationHandler for CliAuthentication {
    async fn select(&self, capabilities: &Capabilities) -> ProvisioningResult<AuthSelection> {
        capabilities.selection_for(self.method)
    }

    async fn static_oob(&self) -> ProvisioningResult<String> {
        self.static_oob
            .clone()
            .ok_or_else(|| ProvisioningError::Config("--static-oob is required".into()))
    }

    async fn output_oob(&self, action: OutputOobAction, size: u8) -> ProvisioningResult<String> {
        eprintln!("Device is outputting a value ({action:?}, up to {size} characters). Enter it:");
        BufReader::new(tokio::io::stdin())
            .lines()
            .next_line()
            .await
            .map_err(|e| ProvisioningError::InvalidInput(format!("stdin: {e}")))?
            .ok_or_else(|| ProvisioningError::InvalidInput("no value entered".into()))
    }

    async fn show_input_oob(&self, action: InputOobAction, value: &str) -> ProvisioningResult<()> {
        eprintln!("Enter {value} on the device ({action:?})");
        Ok(())
    }
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

    let network_key: [u8; 16] = hex::decode(&cli.net_key)
        .map_err(|e| ProvisioningError::Config(format!("--net-key: {e}")))?
        .try_into()
        .map_err(|_| ProvisioningError::Config("--net-key must be 16 bytes".into()))?;
    let data = ProvisioningData::new(network_key, cli.key_index, cli.unicast)
        .with_flags(cli.flags)
        .with_iv_index(cli.iv_index);

    let config = ProvisionerConfig::default()
        .with_attention_timer(cli.attention)
        .with_pdu_timeout(Duration::from_secs(cli.timeout));
    let auth = CliAuthentication {
        method: cli.auth,
        static_oob: cli.static_oob,
    };

    let mut provisioner = Provisioner::connect(&BearerConfig::new(cli.device))
        .await?
        .with_config(config)
        .with_observer(Arc::new(TracingObserver));

    let node = provisioner
        .provision(cli.uuid.unwrap_or_else(Uuid::new_v4), data, &auth)
        .await?;

    println!("{}", serde_json::to_string_pretty(&node)?);
    Ok(())
}
