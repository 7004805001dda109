//! TCP bearer handler for the simulated device.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use uuid::Uuid;

use meshprov_core::{
    Bearer, DeviceState, PduType, ProvisionedNode, ProvisioningError, ProvisioningResult,
    Transport,
};

use crate::capability::OobRegistry;
use crate::config::DeviceConfig;
use crate::state_machine::{failure_pdu, ProvisioneeStateMachine};

/// Unprovisioned device listening for provisioners.
pub struct DeviceServer {
    config: DeviceConfig,
    registry: Arc<OobRegistry>,
}

impl DeviceServer {
    /// Create a new device server.
    pub fn new(config: DeviceConfig, registry: OobRegistry) -> ProvisioningResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(registry),
        })
    }

    /// Accept provisioners forever. Every connection is one attempt.
    pub async fn run(self) -> ProvisioningResult<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| ProvisioningError::Transport(format!("Failed to bind: {}", e)))?;
        let device_uuid = self.config.uuid.unwrap_or_else(Uuid::new_v4);

        tracing::info!(
            device = %device_uuid,
            "device listening on {}",
            self.config.bind_addr
        );

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| ProvisioningError::Transport(format!("Accept failed: {}", e)))?;
            stream
                .set_nodelay(true)
                .map_err(|e| ProvisioningError::Transport(format!("Socket option error: {}", e)))?;

            tracing::debug!("Connection from {}", addr);

            let registry = Arc::clone(&self.registry);
            let max_pdu_size = self.config.max_pdu_size;
            let read_timeout = self.config.read_timeout();

            tokio::spawn(async move {
                match serve_stream(stream, device_uuid, registry, max_pdu_size, read_timeout).await {
                    Ok(node) => tracing::info!(
                        "provisioned by {} as {:#06x} ({} elements)",
                        addr,
                        node.unicast_address,
                        node.element_count
                    ),
                    Err(e) => tracing::error!("Provisioning from {} failed: {}", addr, e),
                }
            });
        }
    }
}

/// Run one provisioning attempt over a length-prefixed byte stream.
///
/// Errors detected by the device are reported with a Failed PDU before being
/// returned. Transport errors and timeouts end the attempt silently.
pub async fn serve_stream<S>(
    stream: S,
    device_uuid: Uuid,
    registry: Arc<OobRegistry>,
    max_pdu_size: usize,
    read_timeout: Duration,
) -> ProvisioningResult<ProvisionedNode>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut bearer = Bearer::with_max_pdu_size(stream, max_pdu_size);
    serve(&mut bearer, device_uuid, registry, read_timeout).await
}

/// Run one provisioning attempt over any transport.
pub async fn serve<T: Transport>(
    transport: &mut T,
    device_uuid: Uuid,
    registry: Arc<OobRegistry>,
    read_timeout: Duration,
) -> ProvisioningResult<ProvisionedNode> {
    let mut sm = ProvisioneeStateMachine::new(device_uuid, Arc::clone(&registry));

    loop {
        let expecting = sm.state().expected_pdu().unwrap_or(PduType::Invite);
        let pdu = tokio::time::timeout(read_timeout, transport.recv_pdu())
            .await
            .map_err(|_| ProvisioningError::Timeout(expecting))??;

        let replies = match sm.handle_pdu(&pdu) {
            Ok(replies) => replies,
            Err(e) => return report(transport, e).await,
        };
        for reply in &replies {
            transport.send_pdu(reply).await?;
        }

        if let Some((action, size)) = sm.pending_input() {
            let registry = Arc::clone(&registry);
            let value = tokio::task::spawn_blocking(move || registry.read_input(action, size))
                .await
                .map_err(|e| ProvisioningError::InvalidInput(format!("input task failed: {}", e)))
                .and_then(|value| value);
            match value.and_then(|value| sm.enter_input(&value)) {
                Ok(replies) => {
                    for reply in &replies {
                        transport.send_pdu(reply).await?;
                    }
                }
                Err(e) => return report(transport, e).await,
            }
        }

        if sm.state() == DeviceState::Complete {
            return sm
                .provisioned_node()
                .cloned()
                .ok_or(ProvisioningError::MissingField("provisioned_node"));
        }
    }
}

/// Send a Failed PDU for `error` and return it.
async fn report<T: Transport, R>(transport: &mut T, error: ProvisioningError) -> ProvisioningResult<R> {
    transport.send_pdu(&failure_pdu(&error)).await?;
    Err(error)
}
