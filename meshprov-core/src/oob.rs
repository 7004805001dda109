//! Out-of-band authentication values.
//!
//! Generators for the values a user reads or types, and the encodings that
//! turn them into the 16-byte AuthValue used by the confirmation MAC.

use rand::Rng;

use crate::capabilities::{InputOobAction, OobValueKind, OutputOobAction};
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::pdu::VALUE_LEN;

/// 16-byte authentication value.
pub type AuthValue = [u8; VALUE_LEN];

/// AuthValue for the No OOB method.
pub const NO_OOB_AUTH_VALUE: AuthValue = [0u8; VALUE_LEN];

const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Static OOB value from its 32-digit hex form.
pub fn static_auth_value(hex_value: &str) -> ProvisioningResult<AuthValue> {
    let bytes = hex::decode(hex_value.trim())
        .map_err(|e| ProvisioningError::InvalidInput(format!("static OOB is not hex: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ProvisioningError::InvalidInput(format!("static OOB must be 16 bytes, got {}", b.len()))
    })
}

/// Numeric and count values: 16-byte big-endian integer.
pub fn numeric_auth_value(value: u32) -> AuthValue {
    u128::from(value).to_be_bytes()
}

/// Alphanumeric values: ASCII left-aligned, zero padded.
pub fn alphanumeric_auth_value(value: &str) -> ProvisioningResult<AuthValue> {
    let value = value.trim().to_ascii_uppercase();
    if value.is_empty() || value.len() > VALUE_LEN {
        return Err(ProvisioningError::InvalidInput(format!(
            "alphanumeric OOB must be 1..={VALUE_LEN} characters"
        )));
    }
    if !value.bytes().all(|b| ALPHANUMERIC.contains(&b)) {
        return Err(ProvisioningError::InvalidInput(format!(
            "'{value}' contains characters outside 0-9A-Z"
        )));
    }

    let mut out = [0u8; VALUE_LEN];
    out[..value.len()].copy_from_slice(value.as_bytes());
    Ok(out)
}

/// Encode a user-visible value of the given kind and width into an AuthValue.
pub fn auth_value_for(kind: OobValueKind, size: u8, value: &str) -> ProvisioningResult<AuthValue> {
    let value = value.trim();
    match kind {
        OobValueKind::Count | OobValueKind::Numeric => {
            if value.is_empty() || value.len() > usize::from(size) {
                return Err(ProvisioningError::InvalidInput(format!(
                    "expected up to {size} digits, got '{value}'"
                )));
            }
            let number: u32 = value.parse().map_err(|_| {
                ProvisioningError::InvalidInput(format!("'{value}' is not a decimal number"))
            })?;
            if kind == OobValueKind::Count && number == 0 {
                return Err(ProvisioningError::InvalidInput("count must be at least 1".into()));
            }
            Ok(numeric_auth_value(number))
        }
        OobValueKind::Alphanumeric => {
            if value.len() > usize::from(size) {
                return Err(ProvisioningError::InvalidInput(format!(
                    "expected up to {size} characters, got '{value}'"
                )));
            }
            alphanumeric_auth_value(value)
        }
    }
}

/// Random value of the given kind, `size` digits or characters wide.
pub fn generate_value<R: Rng + ?Sized>(rng: &mut R, kind: OobValueKind, size: u8) -> String {
    let size = size.clamp(1, 8);
    let bound = 10u32.pow(u32::from(size));
    match kind {
        OobValueKind::Count => rng.gen_range(1..bound).to_string(),
        OobValueKind::Numeric => rng.gen_range(0..bound).to_string(),
        OobValueKind::Alphanumeric => (0..size)
            .map(|_| char::from(ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())]))
            .collect(),
    }
}

/// Value the provisioner shows for the user to enter on the device.
pub fn generate_input_value(action: InputOobAction, size: u8) -> String {
    generate_value(&mut rand::thread_rng(), action.value_kind(), size)
}

/// Value the device outputs for the user to enter on the provisioner.
pub fn generate_output_value(action: OutputOobAction, size: u8) -> String {
    generate_value(&mut rand::thread_rng(), action.value_kind(), size)
}
