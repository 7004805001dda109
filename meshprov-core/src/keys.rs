//! Provisioning key schedule.
//!
//! Implements Mesh Profile 1.0.1 section 5.4.2:
//! - ConfirmationInputs = Invite || Capabilities || Start || PKp || PKd
//! - ConfirmationSalt = s1(ConfirmationInputs)
//! - ConfirmationKey = k1(ECDH, ConfirmationSalt, "prck")
//! - Confirmation = AES-CMAC_ConfirmationKey(Random || AuthValue)
//! - ProvisioningSalt = s1(ConfirmationSalt || RandomProvisioner || RandomDevice)
//! - SessionKey, SessionNonce and DeviceKey via k1 with "prsk", "prsn", "prdk"
//!
//! Both roles call the same functions so their values are bit-identical.

use zeroize::Zeroize;

use crate::crypto::{self, Key, Nonce, SharedSecret};
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::oob::AuthValue;
use crate::pdu::{self, PduType, ENCRYPTED_DATA_LEN, PROVISIONING_DATA_LEN, PUBLIC_KEY_LEN, VALUE_LEN};

const INVITE_PARAMS_LEN: usize = 1;
const CAPABILITIES_PARAMS_LEN: usize = 11;
const START_PARAMS_LEN: usize = 5;

/// Length of the confirmation inputs (145 bytes).
pub const CONFIRMATION_INPUTS_LEN: usize =
    INVITE_PARAMS_LEN + CAPABILITIES_PARAMS_LEN + START_PARAMS_LEN + 2 * PUBLIC_KEY_LEN;

/// Concatenated PDU parameters authenticated by the confirmation.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfirmationInputs([u8; CONFIRMATION_INPUTS_LEN]);

impl ConfirmationInputs {
    /// Build from the retained Invite, Capabilities and Start PDUs (headers
    /// included) and both public keys.
    pub fn new(
        invite_pdu: &[u8],
        capabilities_pdu: &[u8],
        start_pdu: &[u8],
        provisioner_public_key: &[u8; PUBLIC_KEY_LEN],
        device_public_key: &[u8; PUBLIC_KEY_LEN],
    ) -> ProvisioningResult<Self> {
        let mut inputs = [0u8; CONFIRMATION_INPUTS_LEN];
        let mut offset = 0;
        for (pdu, ty, len) in [
            (invite_pdu, PduType::Invite, INVITE_PARAMS_LEN),
            (capabilities_pdu, PduType::Capabilities, CAPABILITIES_PARAMS_LEN),
            (start_pdu, PduType::Start, START_PARAMS_LEN),
        ] {
            let params = pdu::strip_header(pdu);
            // Capabilities may carry trailing bytes; only the defined fields count.
            let params = params.get(..len).ok_or(ProvisioningError::InvalidLength {
                pdu: ty,
                expected: len + pdu::HEADER_LEN,
                actual: pdu.len(),
            })?;
            inputs[offset..offset + len].copy_from_slice(params);
            offset += len;
        }
        inputs[offset..offset + PUBLIC_KEY_LEN].copy_from_slice(provisioner_public_key);
        inputs[offset + PUBLIC_KEY_LEN..].copy_from_slice(device_public_key);
        Ok(Self(inputs))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// ConfirmationSalt.
    pub fn salt(&self) -> Key {
        crypto::s1(&self.0)
    }
}

impl std::fmt::Debug for ConfirmationInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfirmationInputs({})", hex::encode(self.0))
    }
}

pub fn confirmation_key(shared_secret: &SharedSecret, confirmation_salt: &Key) -> Key {
    crypto::k1(shared_secret, confirmation_salt, b"prck")
}

/// Confirmation value over `random || auth_value`.
pub fn confirmation_value(
    confirmation_key: &Key,
    random: &[u8; VALUE_LEN],
    auth_value: &AuthValue,
) -> Key {
    let mut message = [0u8; 2 * VALUE_LEN];
    message[..VALUE_LEN].copy_from_slice(random);
    message[VALUE_LEN..].copy_from_slice(auth_value);
    let value = crypto::aes_cmac(confirmation_key, &message);
    message.zeroize();
    value
}

/// Recompute the peer's confirmation from its revealed random and compare in
/// constant time.
pub fn verify_confirmation(
    confirmation_key: &Key,
    peer_random: &[u8; VALUE_LEN],
    auth_value: &AuthValue,
    peer_confirmation: &[u8; VALUE_LEN],
) -> bool {
    let expected = confirmation_value(confirmation_key, peer_random, auth_value);
    crypto::macs_equal(&expected, peer_confirmation)
}

pub fn provisioning_salt(
    confirmation_salt: &Key,
    provisioner_random: &[u8; VALUE_LEN],
    device_random: &[u8; VALUE_LEN],
) -> Key {
    let mut message = [0u8; 3 * VALUE_LEN];
    message[..VALUE_LEN].copy_from_slice(confirmation_salt);
    message[VALUE_LEN..2 * VALUE_LEN].copy_from_slice(provisioner_random);
    message[2 * VALUE_LEN..].copy_from_slice(device_random);
    crypto::s1(&message)
}

/// Keys protecting the Provisioning Data PDU, plus the resulting device key.
pub struct SessionKeys {
    pub session_key: Key,
    pub session_nonce: Nonce,
    pub device_key: Key,
}

impl SessionKeys {
    pub fn derive(shared_secret: &SharedSecret, provisioning_salt: &Key) -> Self {
        let nonce_full = crypto::k1(shared_secret, provisioning_salt, b"prsn");
        let mut session_nonce = [0u8; 13];
        session_nonce.copy_from_slice(&nonce_full[VALUE_LEN - 13..]);

        Self {
            session_key: crypto::k1(shared_secret, provisioning_salt, b"prsk"),
            session_nonce,
            device_key: crypto::k1(shared_secret, provisioning_salt, b"prdk"),
        }
    }

    /// Encrypt the 25-byte payload into `ciphertext || MIC`.
    pub fn seal(
        &self,
        payload: &[u8; PROVISIONING_DATA_LEN],
    ) -> ProvisioningResult<[u8; ENCRYPTED_DATA_LEN]> {
        let sealed = crypto::encrypt_ccm(&self.session_key, &self.session_nonce, payload)?;
        sealed
            .try_into()
            .map_err(|_| ProvisioningError::Crypto("unexpected AES-CCM output length".into()))
    }

    /// Decrypt and authenticate `ciphertext || MIC`.
    pub fn open(
        &self,
        sealed: &[u8; ENCRYPTED_DATA_LEN],
    ) -> ProvisioningResult<[u8; PROVISIONING_DATA_LEN]> {
        let mut payload = crypto::decrypt_ccm(&self.session_key, &self.session_nonce, sealed)?;
        let result = payload
            .as_slice()
            .try_into()
            .map_err(|_| ProvisioningError::DecryptionFailed);
        payload.zeroize();
        result
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.session_key.zeroize();
        self.session_nonce.zeroize();
        self.device_key.zeroize();
    }
}
