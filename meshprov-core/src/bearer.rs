//! Length-prefixed test bearer shared by provisioner and device.
//!
//! Provisioning PDUs are framed with a 4-byte big-endian length prefix over
//! any async byte stream. PB-ADV and PB-GATT are not implemented.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ProvisioningError, ProvisioningResult};

/// Largest PDU a bearer accepts by default (capabilities may carry a few
/// trailing bytes; the public key PDU is 66).
pub const DEFAULT_MAX_PDU_SIZE: usize = 128;

/// Moves provisioning PDUs between the two roles.
#[async_trait]
pub trait Transport: Send {
    /// Send one complete PDU.
    async fn send_pdu(&mut self, pdu: &[u8]) -> ProvisioningResult<()>;

    /// Receive one complete PDU.
    async fn recv_pdu(&mut self) -> ProvisioningResult<Vec<u8>>;
}

/// Bearer configuration.
#[derive(Debug, Clone)]
pub struct BearerConfig {
    /// Device address.
    pub device_addr: SocketAddr,
    /// Max PDU size in bytes.
    pub max_pdu_size: usize,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl BearerConfig {
    pub fn new(device_addr: SocketAddr) -> Self {
        Self {
            device_addr,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_max_pdu_size(mut self, max_pdu_size: usize) -> Self {
        self.max_pdu_size = max_pdu_size;
        self
    }
}

/// Length-prefixed PDU framing over a byte stream.
#[derive(Debug)]
pub struct Bearer<S> {
    stream: S,
    max_pdu_size: usize,
}

impl Bearer<TcpStream> {
    /// Connect to a device over TCP.
    pub async fn connect(config: &BearerConfig) -> ProvisioningResult<Self> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(config.device_addr),
        )
        .await
        .map_err(|_| ProvisioningError::Transport(format!("Connect to {} timed out", config.device_addr)))?
        .map_err(|e| ProvisioningError::Transport(format!("Connection failed: {}", e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ProvisioningError::Transport(format!("Socket option error: {}", e)))?;

        tracing::debug!("Connected to device at {}", config.device_addr);
        Ok(Self::with_max_pdu_size(stream, config.max_pdu_size))
    }
}

impl<S> Bearer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_pdu_size(stream, DEFAULT_MAX_PDU_SIZE)
    }

    pub fn with_max_pdu_size(stream: S, max_pdu_size: usize) -> Self {
        Self {
            stream,
            max_pdu_size,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Transport for Bearer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_pdu(&mut self, pdu: &[u8]) -> ProvisioningResult<()> {
        let len = u32::try_from(pdu.len())
            .map_err(|_| ProvisioningError::Transport("PDU too large".to_string()))?;

        // Send length prefix + PDU
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| ProvisioningError::Transport(format!("Write error: {}", e)))?;
        self.stream
            .write_all(pdu)
            .await
            .map_err(|e| ProvisioningError::Transport(format!("Write error: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ProvisioningError::Transport(format!("Flush error: {}", e)))?;

        tracing::trace!(pdu = %hex::encode(pdu), "sent");
        Ok(())
    }

    async fn recv_pdu(&mut self) -> ProvisioningResult<Vec<u8>> {
        // Read length prefix
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| ProvisioningError::Transport(format!("Read error: {}", e)))?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > self.max_pdu_size {
            return Err(ProvisioningError::Transport(format!(
                "PDU too large: {} > {}",
                len, self.max_pdu_size
            )));
        }

        // Read PDU body
        let mut pdu = vec![0u8; len];
        self.stream
            .read_exact(&mut pdu)
            .await
            .map_err(|e| ProvisioningError::Transport(format!("Read error: {}", e)))?;

        tracing::trace!(pdu = %hex::encode(&pdu), "received");
        Ok(pdu)
    }
}
