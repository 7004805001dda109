//! Bluetooth Mesh provisioner - admits unprovisioned devices into a network.
//!
//! # Example
//!
//! ```no_run
//! use meshprov_provisioner::{BearerConfig, NoOobAuthentication, Provisioner};
//! use meshprov_core::ProvisioningData;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BearerConfig::new("127.0.0.1:9000".parse()?);
//!     let mut provisioner = Provisioner::connect(&config).await?;
//!
//!     let data = ProvisioningData::new([0x11; 16], 0, 0x0002);
//!     let node = provisioner
//!         .provision(uuid::Uuid::new_v4(), data, &NoOobAuthentication)
//!         .await?;
//!     println!("Provisioned: {:?}", node);
//!
//!     Ok(())
//! }
//! ```

pub mod phases;
mod state_machine;

pub use meshprov_core::bearer::{Bearer, BearerConfig, Transport, DEFAULT_MAX_PDU_SIZE};
pub use state_machine::ProvisionerStateMachine;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use uuid::Uuid;

use meshprov_core::{
    AuthMethod, AuthSelection, Capabilities, InputOobAction, OutputOobAction, PduType,
    ProvisionedNode, ProvisioningData, ProvisioningError, ProvisioningObserver,
    ProvisioningResult,
};

/// Provisioner settings.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Attention timer sent in the Invite, in seconds.
    pub attention_timer: u8,
    /// How long to wait for each PDU from the device.
    pub pdu_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            attention_timer: 5,
            pdu_timeout: Duration::from_secs(30),
        }
    }
}

impl ProvisionerConfig {
    pub fn with_attention_timer(mut self, seconds: u8) -> Self {
        self.attention_timer = seconds;
        self
    }

    pub fn with_pdu_timeout(mut self, timeout: Duration) -> Self {
        self.pdu_timeout = timeout;
        self
    }
}

/// The user-facing half of authentication.
#[async_trait]
pub trait AuthenticationHandler: Send + Sync {
    /// Pick an authentication method from what the device offers.
    async fn select(&self, capabilities: &Capabilities) -> ProvisioningResult<AuthSelection>;

    /// Static OOB value as 32 hex digits.
    async fn static_oob(&self) -> ProvisioningResult<String> {
        Err(ProvisioningError::UnsupportedMethod("static OOB".into()))
    }

    /// Value the device output, as read by the user.
    async fn output_oob(&self, action: OutputOobAction, size: u8) -> ProvisioningResult<String> {
        let _ = size;
        Err(ProvisioningError::UnsupportedMethod(format!("output OOB ({action:?})")))
    }

    /// Show the value the user must enter on the device.
    async fn show_input_oob(&self, action: InputOobAction, value: &str) -> ProvisioningResult<()> {
        tracing::info!(?action, value, "enter this value on the device");
        Ok(())
    }
}

/// Always selects No OOB.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOobAuthentication;

#[async_trait]
impl AuthenticationHandler for NoOobAuthentication {
    async fn select(&self, _capabilities: &Capabilities) -> ProvisioningResult<AuthSelection> {
        Ok(AuthSelection::NoOob)
    }
}

/// Selects static OOB with a known value.
#[derive(Debug, Clone)]
pub struct StaticOobAuthentication {
    value: String,
}

impl StaticOobAuthentication {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl AuthenticationHandler for StaticOobAuthentication {
    async fn select(&self, capabilities: &Capabilities) -> ProvisioningResult<AuthSelection> {
        capabilities.selection_for(AuthMethod::StaticOob)
    }

    async fn static_oob(&self) -> ProvisioningResult<String> {
        Ok(self.value.clone())
    }
}

/// Runs complete provisioning attempts over a transport.
pub struct Provisioner<T> {
    transport: T,
    config: ProvisionerConfig,
    observer: Option<Arc<dyn ProvisioningObserver>>,
}

impl Provisioner<Bearer<TcpStream>> {
    /// Connect to a device over the TCP test bearer.
    pub async fn connect(config: &BearerConfig) -> ProvisioningResult<Self> {
        let bearer = Bearer::connect(config).await?;
        Ok(Self::new(bearer, ProvisionerConfig::default()))
    }
}

impl<T: Transport> Provisioner<T> {
    pub fn new(transport: T, config: ProvisionerConfig) -> Self {
        Self {
            transport,
            config,
            observer: None,
        }
    }

    pub fn with_config(mut self, config: ProvisionerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProvisioningObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Provision one device. Attempts are sequential; the session is gone
    /// when this returns, whatever the outcome.
    pub async fn provision(
        &mut self,
        device_uuid: Uuid,
        data: ProvisioningData,
        auth: &dyn AuthenticationHandler,
    ) -> ProvisioningResult<ProvisionedNode> {
        let mut sm = ProvisionerStateMachine::new(device_uuid, data)?;
        if let Some(observer) = &self.observer {
            sm = sm.with_observer(Arc::clone(observer));
        }

        tracing::info!(device = %device_uuid, "starting provisioning");
        let result = self.run(&mut sm, auth).await;
        match &result {
            Ok(node) => tracing::info!(
                device = %device_uuid,
                address = format_args!("{:#06x}", node.unicast_address),
                "device provisioned"
            ),
            Err(e) => {
                sm.abort();
                tracing::error!(device = %device_uuid, "provisioning failed: {}", e);
            }
        }
        result
    }

    async fn run(
        &mut self,
        sm: &mut ProvisionerStateMachine,
        auth: &dyn AuthenticationHandler,
    ) -> ProvisioningResult<ProvisionedNode> {
        self.send(sm.invite(self.config.attention_timer)?).await?;

        let pdu = self.recv(PduType::Capabilities).await?;
        let capabilities = sm.on_capabilities(&pdu)?;
        tracing::debug!(?capabilities, methods = ?capabilities.auth_methods(), "device capabilities");

        let selection = auth.select(&capabilities).await?;
        self.send(sm.start(selection)?).await?;

        self.send(sm.public_key()?).await?;
        let pdu = self.recv(PduType::PublicKey).await?;
        sm.on_public_key(&pdu)?;

        let oob = match selection {
            AuthSelection::NoOob => None,
            AuthSelection::StaticOob => Some(auth.static_oob().await?),
            AuthSelection::OutputOob { action, size } => Some(auth.output_oob(action, size).await?),
            AuthSelection::InputOob { action, .. } => {
                let value = sm
                    .input_oob_value()
                    .ok_or(ProvisioningError::MissingField("oob_value"))?
                    .to_string();
                auth.show_input_oob(action, &value).await?;
                let pdu = self.recv(PduType::InputComplete).await?;
                sm.on_input_complete(&pdu)?;
                None
            }
        };

        self.send(sm.confirmation(oob.as_deref())?).await?;
        let pdu = self.recv(PduType::Confirmation).await?;
        sm.on_confirmation(&pdu)?;

        self.send(sm.random()?).await?;
        let pdu = self.recv(PduType::Random).await?;
        sm.on_random(&pdu)?;

        self.send(sm.data()?).await?;
        let pdu = self.recv(PduType::Complete).await?;
        sm.on_complete(&pdu)
    }

    async fn send(&mut self, pdu: Vec<u8>) -> ProvisioningResult<()> {
        self.transport.send_pdu(&pdu).await
    }

    async fn recv(&mut self, expecting: PduType) -> ProvisioningResult<Vec<u8>> {
        tokio::time::timeout(self.config.pdu_timeout, self.transport.recv_pdu())
            .await
            .map_err(|_| ProvisioningError::Timeout(expecting))?
    }
}
