//! Provisioning PDU codec.
//!
//! Every provisioning PDU is `[0x03][type][parameters..]`: the proxy PDU type
//! for provisioning followed by the provisioning PDU type. Multi-byte integers
//! are big-endian.

use serde::{Deserialize, Serialize};

use crate::capabilities::{
    Algorithm, AuthMethod, AuthSelection, Capabilities, InputOobAction, OutputOobAction,
};
use crate::error::{FailureCode, ProvisioningError, ProvisioningResult};

/// Proxy PDU type carrying provisioning PDUs.
pub const PDU_TYPE_PROVISIONING: u8 = 0x03;

/// Header length (proxy PDU type + provisioning PDU type).
pub const HEADER_LEN: usize = 2;

/// Length of an uncompressed P-256 public key without the SEC1 prefix.
pub const PUBLIC_KEY_LEN: usize = 64;

/// Length of confirmation and random values.
pub const VALUE_LEN: usize = 16;

/// Plain provisioning data length.
pub const PROVISIONING_DATA_LEN: usize = 25;

/// AES-CCM MIC appended to the provisioning data.
pub const DATA_MIC_LEN: usize = 8;

/// Encrypted provisioning data with its MIC.
pub const ENCRYPTED_DATA_LEN: usize = PROVISIONING_DATA_LEN + DATA_MIC_LEN;

/// Provisioning PDU types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PduType {
    Invite = 0x00,
    Capabilities = 0x01,
    Start = 0x02,
    PublicKey = 0x03,
    InputComplete = 0x04,
    Confirmation = 0x05,
    Random = 0x06,
    Data = 0x07,
    Complete = 0x08,
    Failed = 0x09,
}

impl PduType {
    /// Decode a provisioning PDU type byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Invite,
            0x01 => Self::Capabilities,
            0x02 => Self::Start,
            0x03 => Self::PublicKey,
            0x04 => Self::InputComplete,
            0x05 => Self::Confirmation,
            0x06 => Self::Random,
            0x07 => Self::Data,
            0x08 => Self::Complete,
            0x09 => Self::Failed,
            _ => return None,
        })
    }

    /// Exact PDU length including the header, or the minimum for
    /// capabilities.
    pub fn pdu_len(self) -> usize {
        HEADER_LEN
            + match self {
                Self::Invite => 1,
                Self::Capabilities => 11,
                Self::Start => 5,
                Self::PublicKey => PUBLIC_KEY_LEN,
                Self::InputComplete | Self::Complete => 0,
                Self::Confirmation | Self::Random => VALUE_LEN,
                Self::Data => ENCRYPTED_DATA_LEN,
                Self::Failed => 1,
            }
    }

    /// The two header bytes for this PDU type.
    pub fn header(self) -> [u8; HEADER_LEN] {
        [PDU_TYPE_PROVISIONING, self as u8]
    }
}

/// Read the PDU type from a raw provisioning PDU.
pub fn pdu_type(pdu: &[u8]) -> ProvisioningResult<PduType> {
    match pdu {
        [PDU_TYPE_PROVISIONING, ty, ..] => PduType::from_byte(*ty).ok_or_else(|| {
            ProvisioningError::InvalidHeader(format!("unknown provisioning PDU type {ty:#04x}"))
        }),
        [other, _, ..] => Err(ProvisioningError::InvalidHeader(format!(
            "proxy PDU type {other:#04x} is not provisioning"
        ))),
        _ => Err(ProvisioningError::InvalidHeader(format!(
            "PDU too short: {} bytes",
            pdu.len()
        ))),
    }
}

/// Check `pdu` is exactly the length its type requires and return its
/// parameters.
pub(crate) fn parameters(pdu: &[u8], ty: PduType) -> ProvisioningResult<&[u8]> {
    let expected = ty.pdu_len();
    if pdu.len() != expected {
        return Err(ProvisioningError::InvalidLength {
            pdu: ty,
            expected,
            actual: pdu.len(),
        });
    }
    Ok(&pdu[HEADER_LEN..])
}

/// Strip the 2-byte header from a retained PDU.
pub fn strip_header(pdu: &[u8]) -> &[u8] {
    pdu.get(HEADER_LEN..).unwrap_or_default()
}

/// Parameters of a Provisioning Start PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    pub algorithm: Algorithm,
    /// Always `false` when built by the provisioner: OOB public keys are
    /// never used.
    pub public_key_oob: bool,
    pub authentication: AuthSelection,
}

impl Start {
    fn encode(&self, out: &mut Vec<u8>) {
        let (action, size) = match self.authentication {
            AuthSelection::NoOob | AuthSelection::StaticOob => (0, 0),
            AuthSelection::OutputOob { action, size } => (action as u8, size),
            AuthSelection::InputOob { action, size } => (action as u8, size),
        };
        out.push(self.algorithm as u8);
        out.push(u8::from(self.public_key_oob));
        out.push(self.authentication.method() as u8);
        out.push(action);
        out.push(size);
    }

    fn decode(params: &[u8]) -> ProvisioningResult<Self> {
        let invalid = |reason: String| ProvisioningError::InvalidValue {
            pdu: PduType::Start,
            reason,
        };

        let algorithm = Algorithm::from_byte(params[0])
            .ok_or_else(|| invalid(format!("unknown algorithm {:#04x}", params[0])))?;
        let public_key_oob = match params[1] {
            0x00 => false,
            0x01 => true,
            other => return Err(invalid(format!("invalid public key type {other:#04x}"))),
        };
        let method = AuthMethod::from_byte(params[2])
            .ok_or_else(|| invalid(format!("unknown authentication method {:#04x}", params[2])))?;
        let (action, size) = (params[3], params[4]);

        let authentication = match method {
            AuthMethod::NoOob | AuthMethod::StaticOob => {
                if action != 0 || size != 0 {
                    return Err(invalid(format!(
                        "{method:?} requires zero action and size"
                    )));
                }
                if method == AuthMethod::NoOob {
                    AuthSelection::NoOob
                } else {
                    AuthSelection::StaticOob
                }
            }
            AuthMethod::OutputOob => AuthSelection::OutputOob {
                action: OutputOobAction::from_index(action)
                    .ok_or_else(|| invalid(format!("unknown output action {action}")))?,
                size: checked_oob_size(size).map_err(invalid)?,
            },
            AuthMethod::InputOob => AuthSelection::InputOob {
                action: InputOobAction::from_index(action)
                    .ok_or_else(|| invalid(format!("unknown input action {action}")))?,
                size: checked_oob_size(size).map_err(invalid)?,
            },
        };

        Ok(Self {
            algorithm,
            public_key_oob,
            authentication,
        })
    }
}

/// OOB sizes are 1..=8 characters or digits.
pub(crate) fn checked_oob_size(size: u8) -> Result<u8, String> {
    if (1..=8).contains(&size) {
        Ok(size)
    } else {
        Err(format!("OOB size {size} outside 1..=8"))
    }
}

/// A decoded provisioning PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Invite { attention_timer: u8 },
    Capabilities(Capabilities),
    Start(Start),
    PublicKey([u8; PUBLIC_KEY_LEN]),
    InputComplete,
    Confirmation([u8; VALUE_LEN]),
    Random([u8; VALUE_LEN]),
    Data([u8; ENCRYPTED_DATA_LEN]),
    Complete,
    Failed(FailureCode),
}

impl Pdu {
    /// PDU type of this message.
    pub fn pdu_type(&self) -> PduType {
        match self {
            Self::Invite { .. } => PduType::Invite,
            Self::Capabilities(_) => PduType::Capabilities,
            Self::Start(_) => PduType::Start,
            Self::PublicKey(_) => PduType::PublicKey,
            Self::InputComplete => PduType::InputComplete,
            Self::Confirmation(_) => PduType::Confirmation,
            Self::Random(_) => PduType::Random,
            Self::Data(_) => PduType::Data,
            Self::Complete => PduType::Complete,
            Self::Failed(_) => PduType::Failed,
        }
    }

    /// Encode into wire bytes, header included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ty = self.pdu_type();
        let mut out = Vec::with_capacity(ty.pdu_len());
        out.extend_from_slice(&ty.header());
        match self {
            Self::Invite { attention_timer } => out.push(*attention_timer),
            Self::Capabilities(caps) => caps.encode(&mut out),
            Self::Start(start) => start.encode(&mut out),
            Self::PublicKey(xy) => out.extend_from_slice(xy),
            Self::Confirmation(value) | Self::Random(value) => out.extend_from_slice(value),
            Self::Data(data) => out.extend_from_slice(data),
            Self::Failed(code) => out.push(code.to_byte()),
            Self::InputComplete | Self::Complete => {}
        }
        out
    }

    /// Decode wire bytes. Lengths are checked exactly, except for capabilities
    /// which may carry trailing bytes.
    pub fn parse(pdu: &[u8]) -> ProvisioningResult<Self> {
        let ty = pdu_type(pdu)?;
        Ok(match ty {
            PduType::Capabilities => Self::Capabilities(Capabilities::parse(pdu)?),
            PduType::Invite => Self::Invite {
                attention_timer: parameters(pdu, ty)?[0],
            },
            PduType::Start => Self::Start(Start::decode(parameters(pdu, ty)?)?),
            PduType::PublicKey => Self::PublicKey(to_array(parameters(pdu, ty)?)),
            PduType::InputComplete => {
                parameters(pdu, ty)?;
                Self::InputComplete
            }
            PduType::Confirmation => Self::Confirmation(to_array(parameters(pdu, ty)?)),
            PduType::Random => Self::Random(to_array(parameters(pdu, ty)?)),
            PduType::Data => Self::Data(to_array(parameters(pdu, ty)?)),
            PduType::Complete => {
                parameters(pdu, ty)?;
                Self::Complete
            }
            PduType::Failed => Self::Failed(FailureCode::from_byte(parameters(pdu, ty)?[0])),
        })
    }
}

/// Copy a length-checked slice into a fixed array.
fn to_array<const N: usize>(params: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(params);
    out
}
