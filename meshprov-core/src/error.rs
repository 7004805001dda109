//! Error types and failure codes for mesh provisioning.

use thiserror::Error;

use crate::pdu::PduType;

/// Provisioning failure codes as carried in the Provisioning Failed PDU.
///
/// Codes outside the known range are kept as [`FailureCode::Unknown`] rather
/// than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// Prohibited (reserved for future use).
    Prohibited,
    /// The provisioning protocol PDU is not recognized by the device.
    InvalidPdu,
    /// The arguments of the protocol PDUs are outside expected values or the
    /// length of the PDU is different than expected.
    InvalidFormat,
    /// The PDU received was not expected at this moment of the procedure.
    UnexpectedPdu,
    /// The computed confirmation value was not successfully verified.
    ConfirmationFailed,
    /// The provisioning protocol cannot be continued due to insufficient
    /// resources in the device.
    OutOfResources,
    /// The Data block was not successfully decrypted.
    DecryptionFailed,
    /// An unexpected error occurred that may not be recoverable.
    UnexpectedError,
    /// The device cannot assign consecutive unicast addresses to all elements.
    CannotAssignAddresses,
    /// Any code this implementation does not know about.
    Unknown(u8),
}

impl FailureCode {
    /// Decode a failure code byte. Never fails.
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x00 => Self::Prohibited,
            0x01 => Self::InvalidPdu,
            0x02 => Self::InvalidFormat,
            0x03 => Self::UnexpectedPdu,
            0x04 => Self::ConfirmationFailed,
            0x05 => Self::OutOfResources,
            0x06 => Self::DecryptionFailed,
            0x07 => Self::UnexpectedError,
            0x08 => Self::CannotAssignAddresses,
            other => Self::Unknown(other),
        }
    }

    /// Wire value of this code.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Prohibited => 0x00,
            Self::InvalidPdu => 0x01,
            Self::InvalidFormat => 0x02,
            Self::UnexpectedPdu => 0x03,
            Self::ConfirmationFailed => 0x04,
            Self::OutOfResources => 0x05,
            Self::DecryptionFailed => 0x06,
            Self::UnexpectedError => 0x07,
            Self::CannotAssignAddresses => 0x08,
            Self::Unknown(code) => code,
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prohibited => write!(f, "prohibited"),
            Self::InvalidPdu => write!(f, "invalid_pdu"),
            Self::InvalidFormat => write!(f, "invalid_format"),
            Self::UnexpectedPdu => write!(f, "unexpected_pdu"),
            Self::ConfirmationFailed => write!(f, "confirmation_failed"),
            Self::OutOfResources => write!(f, "out_of_resources"),
            Self::DecryptionFailed => write!(f, "decryption_failed"),
            Self::UnexpectedError => write!(f, "unexpected_error"),
            Self::CannotAssignAddresses => write!(f, "cannot_assign_addresses"),
            Self::Unknown(code) => write!(f, "unknown_error_code({code:#04x})"),
        }
    }
}

/// Mesh provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// PDU length differs from what its type requires.
    #[error("invalid {pdu:?} PDU length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        pdu: PduType,
        expected: usize,
        actual: usize,
    },

    /// PDU does not start with the provisioning header or has an unknown type.
    #[error("invalid provisioning PDU header: {0}")]
    InvalidHeader(String),

    /// A field inside a PDU carries a value outside its allowed range.
    #[error("invalid value in {pdu:?} PDU: {reason}")]
    InvalidValue { pdu: PduType, reason: String },

    /// Capabilities PDU advertised zero elements.
    #[error("device advertised zero elements")]
    NoElements,

    /// A well formed PDU arrived at the wrong point of the procedure.
    #[error("unexpected {received:?} PDU, expected {expected:?}")]
    UnexpectedPdu { expected: PduType, received: PduType },

    /// State machine asked to perform a step out of order.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// Session field read before the step that populates it ran.
    #[error("session field `{0}` has not been populated")]
    MissingField(&'static str),

    /// Peer confirmation did not match the recomputed value.
    #[error("confirmation value mismatch")]
    ConfirmationFailed,

    /// The peer aborted with a Provisioning Failed PDU.
    #[error("device reported provisioning failure: {0}")]
    RemoteFailure(FailureCode),

    /// Peer public key is not a valid P-256 point.
    #[error("invalid peer public key")]
    InvalidPublicKey,

    /// AES-CCM authentication failed on the provisioning data.
    #[error("provisioning data decryption failed")]
    DecryptionFailed,

    /// Other failure of a cryptographic primitive.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Caller supplied provisioning data or OOB input that is not acceptable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unicast range of the node runs past the last unicast address.
    #[error("cannot assign addresses: {0}")]
    CannotAssignAddresses(String),

    /// Selected authentication method is not offered by the device.
    #[error("authentication method not supported by device: {0}")]
    UnsupportedMethod(String),

    /// Transport error (connection, I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// No PDU arrived within the configured window.
    #[error("timed out waiting for {0:?} PDU")]
    Timeout(PduType),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProvisioningError {
    /// Failure code a device reports to the provisioner for this error.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::InvalidHeader(_) => FailureCode::InvalidPdu,
            Self::InvalidLength { .. }
            | Self::InvalidValue { .. }
            | Self::NoElements
            | Self::InvalidPublicKey
            | Self::UnsupportedMethod(_) => FailureCode::InvalidFormat,
            Self::UnexpectedPdu { .. } | Self::InvalidTransition(_) => FailureCode::UnexpectedPdu,
            Self::ConfirmationFailed => FailureCode::ConfirmationFailed,
            Self::DecryptionFailed => FailureCode::DecryptionFailed,
            Self::CannotAssignAddresses(_) => FailureCode::CannotAssignAddresses,
            Self::RemoteFailure(code) => *code,
            _ => FailureCode::UnexpectedError,
        }
    }
}

/// Result type alias for provisioning operations.
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_code_decoding() {
        assert_eq!(FailureCode::from_byte(0x04), FailureCode::ConfirmationFailed);
        assert_eq!(FailureCode::from_byte(0x08), FailureCode::CannotAssignAddresses);
        assert_eq!(FailureCode::from_byte(0xFF), FailureCode::Unknown(0xFF));
        assert_eq!(FailureCode::from_byte(0x09), FailureCode::Unknown(0x09));
    }

    #[test]
    fn failure_code_byte_round_trip() {
        for code in 0..=u8::MAX {
            assert_eq!(FailureCode::from_byte(code).to_byte(), code);
        }
    }

    #[test]
    fn failure_code_display() {
        assert_eq!(FailureCode::ConfirmationFailed.to_string(), "confirmation_failed");
        assert_eq!(FailureCode::Unknown(0xFF).to_string(), "unknown_error_code(0xff)");
    }

    #[test]
    fn failure_code_serde() {
        let json = serde_json::to_string(&FailureCode::DecryptionFailed).unwrap();
        assert_eq!(json, "\"decryption_failed\"");

        let parsed: FailureCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, FailureCode::DecryptionFailed);
    }

    #[test]
    fn errors_map_to_wire_codes() {
        assert_eq!(
            ProvisioningError::ConfirmationFailed.failure_code(),
            FailureCode::ConfirmationFailed
        );
        assert_eq!(
            ProvisioningError::UnexpectedPdu {
                expected: PduType::Start,
                received: PduType::Data,
            }
            .failure_code(),
            FailureCode::UnexpectedPdu
        );
        assert_eq!(ProvisioningError::NoElements.failure_code(), FailureCode::InvalidFormat);
        assert_eq!(
            ProvisioningError::CannotAssignAddresses("0x7fff + 2".into()).failure_code(),
            FailureCode::CannotAssignAddresses
        );
        assert_eq!(
            ProvisioningError::Transport("closed".into()).failure_code(),
            FailureCode::UnexpectedError
        );
    }
}
