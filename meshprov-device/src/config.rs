//! Device configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use meshprov_core::oob;
use meshprov_core::{
    Capabilities, InputOobAction, OutputOobAction, ProvisioningError, ProvisioningResult,
};

use crate::capability::OobRegistry;

/// Largest OOB size the Start PDU can carry.
const MAX_OOB_SIZE: u8 = 8;

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Address to listen on for the test bearer.
    pub bind_addr: SocketAddr,
    /// Device UUID; random per run when unset.
    pub uuid: Option<Uuid>,
    /// Capabilities advertised in reply to an Invite.
    pub capabilities: Capabilities,
    /// Static OOB value as 32 hex digits, required when static OOB is advertised.
    pub static_oob: Option<String>,
    /// How long to wait for the next PDU, in seconds.
    pub read_timeout_secs: u64,
    /// Max PDU size in bytes.
    pub max_pdu_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9000)),
            uuid: None,
            capabilities: Capabilities::new(1),
            static_oob: None,
            read_timeout_secs: 30,
            max_pdu_size: 128,
        }
    }
}

impl DeviceConfig {
    /// Create a new config with custom bind address.
    pub fn with_addr(addr: impl Into<SocketAddr>) -> Self {
        Self {
            bind_addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Advertise static OOB with the given hex value.
    pub fn with_static_oob(mut self, value: impl Into<String>) -> Self {
        self.capabilities.static_oob = true;
        self.static_oob = Some(value.into());
        self
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> ProvisioningResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProvisioningError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Check the advertised capabilities are consistent and usable.
    pub fn validate(&self) -> ProvisioningResult<()> {
        let caps = &self.capabilities;
        if caps.element_count == 0 {
            return Err(ProvisioningError::Config("element count must be at least 1".into()));
        }
        if caps.public_key_oob {
            return Err(ProvisioningError::Config("OOB public keys are not supported".into()));
        }
        match (caps.static_oob, &self.static_oob) {
            (true, Some(value)) => {
                oob::static_auth_value(value)
                    .map_err(|e| ProvisioningError::Config(format!("static OOB: {e}")))?;
            }
            (true, None) => {
                return Err(ProvisioningError::Config("static OOB advertised without a value".into()))
            }
            (false, Some(_)) => {
                return Err(ProvisioningError::Config("static OOB value given but not advertised".into()))
            }
            (false, None) => {}
        }
        check_oob("output", caps.output_oob_size, caps.output_oob_actions.len())?;
        check_oob("input", caps.input_oob_size, caps.input_oob_actions.len())?;
        if self.max_pdu_size < 66 {
            return Err(ProvisioningError::Config(format!(
                "max PDU size {} cannot carry a public key",
                self.max_pdu_size
            )));
        }
        Ok(())
    }

    /// Build the OOB registry for these capabilities with the given user
    /// interaction handlers.
    pub fn registry<O, I>(&self, output: O, input: I) -> ProvisioningResult<OobRegistry>
    where
        O: Fn(OutputOobAction, &str) + Send + Sync + 'static,
        I: Fn(InputOobAction, u8) -> ProvisioningResult<String> + Send + Sync + 'static,
    {
        self.validate()?;
        let caps = &self.capabilities;
        let mut registry = OobRegistry::new(caps.element_count);
        if let Some(value) = &self.static_oob {
            registry = registry.with_static_oob(oob::static_auth_value(value)?);
        }
        if caps.output_oob_size > 0 {
            registry = registry.with_output(
                caps.output_oob_size,
                caps.output_oob_actions.iter().copied(),
                output,
            );
        }
        if caps.input_oob_size > 0 {
            registry = registry.with_input(
                caps.input_oob_size,
                caps.input_oob_actions.iter().copied(),
                input,
            );
        }
        Ok(registry)
    }
}

fn check_oob(kind: &str, size: u8, actions: usize) -> ProvisioningResult<()> {
    if size > MAX_OOB_SIZE {
        return Err(ProvisioningError::Config(format!(
            "{kind} OOB size {size} exceeds {MAX_OOB_SIZE}"
        )));
    }
    if (size == 0) != (actions == 0) {
        return Err(ProvisioningError::Config(format!(
            "{kind} OOB needs both a size and at least one action"
        )));
    }
    Ok(())
}
