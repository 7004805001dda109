//! Provisioner-side phase functions.
//!
//! Each function takes only the fields its phase needs and returns the
//! fields it produces; the state machine owns the session and stores them.

use meshprov_core::crypto::{self, Key, KeyPair, SharedSecret};
use meshprov_core::keys::{self, ConfirmationInputs, SessionKeys};
use meshprov_core::oob::{self, AuthValue, NO_OOB_AUTH_VALUE};
use meshprov_core::pdu::{PUBLIC_KEY_LEN, VALUE_LEN};
use meshprov_core::{
    Algorithm, AuthSelection, Capabilities, Pdu, PduType, ProvisioningData, ProvisioningError,
    ProvisioningResult, Start,
};

/// Decode an inbound PDU and require its type. A Failed PDU from the device
/// becomes [`ProvisioningError::RemoteFailure`].
pub fn expect_pdu(pdu: &[u8], expected: PduType) -> ProvisioningResult<Pdu> {
    let received = meshprov_core::pdu::pdu_type(pdu)?;
    if received == PduType::Failed {
        if let Pdu::Failed(code) = Pdu::parse(pdu)? {
            return Err(ProvisioningError::RemoteFailure(code));
        }
    }
    if received != expected {
        return Err(ProvisioningError::UnexpectedPdu { expected, received });
    }
    Pdu::parse(pdu)
}

pub fn build_invite(attention_timer: u8) -> Vec<u8> {
    Pdu::Invite { attention_timer }.to_bytes()
}

pub fn parse_capabilities(pdu: &[u8]) -> ProvisioningResult<Capabilities> {
    match expect_pdu(pdu, PduType::Capabilities)? {
        Pdu::Capabilities(caps) => Ok(caps),
        other => Err(unexpected(PduType::Capabilities, &other)),
    }
}

/// Start PDU for a validated selection. OOB public keys are never requested.
pub fn build_start(selection: AuthSelection) -> Vec<u8> {
    Pdu::Start(Start {
        algorithm: Algorithm::FipsP256,
        public_key_oob: false,
        authentication: selection,
    })
    .to_bytes()
}

/// For input OOB, the value to show the user and its AuthValue.
pub fn input_oob_value(selection: &AuthSelection) -> ProvisioningResult<Option<(String, AuthValue)>> {
    match *selection {
        AuthSelection::InputOob { action, size } => {
            let value = oob::generate_input_value(action, size);
            let auth = oob::auth_value_for(action.value_kind(), size, &value)?;
            Ok(Some((value, auth)))
        }
        _ => Ok(None),
    }
}

pub fn build_public_key(key_pair: &KeyPair) -> Vec<u8> {
    Pdu::PublicKey(*key_pair.public_xy()).to_bytes()
}

/// Device public key and the ECDH secret agreed with it.
pub fn parse_public_key(
    pdu: &[u8],
    key_pair: &KeyPair,
) -> ProvisioningResult<([u8; PUBLIC_KEY_LEN], SharedSecret)> {
    match expect_pdu(pdu, PduType::PublicKey)? {
        Pdu::PublicKey(xy) => {
            if &xy == key_pair.public_xy() {
                return Err(ProvisioningError::InvalidPublicKey);
            }
            let secret = key_pair.agree(&xy)?;
            Ok((xy, secret))
        }
        other => Err(unexpected(PduType::PublicKey, &other)),
    }
}

pub fn parse_input_complete(pdu: &[u8]) -> ProvisioningResult<()> {
    expect_pdu(pdu, PduType::InputComplete).map(|_| ())
}

/// AuthValue for static and output OOB from what the user supplied. No OOB
/// uses zeros; input OOB is fixed at Start and never reaches this function.
pub fn auth_value(selection: &AuthSelection, supplied: Option<&str>) -> ProvisioningResult<AuthValue> {
    let required = || {
        supplied.ok_or_else(|| {
            ProvisioningError::InvalidInput(format!("{:?} needs an OOB value", selection.method()))
        })
    };
    match *selection {
        AuthSelection::NoOob => Ok(NO_OOB_AUTH_VALUE),
        AuthSelection::StaticOob => oob::static_auth_value(required()?),
        AuthSelection::OutputOob { action, size } => {
            oob::auth_value_for(action.value_kind(), size, required()?)
        }
        AuthSelection::InputOob { .. } => Err(ProvisioningError::MissingField("auth_value")),
    }
}

/// Confirmation salt and the Confirmation PDU over `random || auth_value`.
pub fn build_confirmation(
    inputs: &ConfirmationInputs,
    shared_secret: &SharedSecret,
    random: &[u8; VALUE_LEN],
    auth_value: &AuthValue,
) -> (Key, Vec<u8>) {
    let salt = inputs.salt();
    let key = keys::confirmation_key(shared_secret, &salt);
    let confirmation = keys::confirmation_value(&key, random, auth_value);
    (salt, Pdu::Confirmation(confirmation).to_bytes())
}

pub fn parse_confirmation(pdu: &[u8]) -> ProvisioningResult<[u8; VALUE_LEN]> {
    match expect_pdu(pdu, PduType::Confirmation)? {
        Pdu::Confirmation(value) => Ok(value),
        other => Err(unexpected(PduType::Confirmation, &other)),
    }
}

pub fn build_random(random: &[u8; VALUE_LEN]) -> Vec<u8> {
    Pdu::Random(*random).to_bytes()
}

/// Device random, and whether it reproduces the device's confirmation.
pub fn verify_random(
    pdu: &[u8],
    confirmation_salt: &Key,
    shared_secret: &SharedSecret,
    auth_value: &AuthValue,
    device_confirmation: &[u8; VALUE_LEN],
) -> ProvisioningResult<([u8; VALUE_LEN], bool)> {
    let device_random = match expect_pdu(pdu, PduType::Random)? {
        Pdu::Random(value) => value,
        other => return Err(unexpected(PduType::Random, &other)),
    };
    let key = keys::confirmation_key(shared_secret, confirmation_salt);
    let verified = keys::verify_confirmation(&key, &device_random, auth_value, device_confirmation);
    Ok((device_random, verified))
}

/// Encrypted Data PDU and the device key both sides now share.
pub fn build_data(
    confirmation_salt: &Key,
    shared_secret: &SharedSecret,
    provisioner_random: &[u8; VALUE_LEN],
    device_random: &[u8; VALUE_LEN],
    data: &ProvisioningData,
) -> ProvisioningResult<(Vec<u8>, Key)> {
    let salt = keys::provisioning_salt(confirmation_salt, provisioner_random, device_random);
    let session_keys = SessionKeys::derive(shared_secret, &salt);
    let sealed = session_keys.seal(&data.to_bytes())?;
    Ok((Pdu::Data(sealed).to_bytes(), session_keys.device_key))
}

pub fn parse_complete(pdu: &[u8]) -> ProvisioningResult<()> {
    expect_pdu(pdu, PduType::Complete).map(|_| ())
}

fn unexpected(expected: PduType, received: &Pdu) -> ProvisioningError {
    ProvisioningError::UnexpectedPdu {
        expected,
        received: received.pdu_type(),
    }
}

/// Fresh 16-byte random for the confirmation.
pub fn fresh_random() -> [u8; VALUE_LEN] {
    crypto::random_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshprov_core::{FailureCode, InputOobAction, OutputOobAction};

    #[test]
    fn failed_pdu_is_remote_failure() {
        let failed = Pdu::Failed(FailureCode::ConfirmationFailed).to_bytes();
        assert!(matches!(
            parse_confirmation(&failed),
            Err(ProvisioningError::RemoteFailure(FailureCode::ConfirmationFailed))
        ));
    }

    #[test]
    fn wrong_pdu_type_is_unexpected() {
        assert!(matches!(
            parse_complete(&build_random(&[0; 16])),
            Err(ProvisioningError::UnexpectedPdu {
                expected: PduType::Complete,
                received: PduType::Random,
            })
        ));
    }

    #[test]
    fn start_never_requests_oob_public_key() {
        let pdu = build_start(AuthSelection::StaticOob);
        assert_eq!(pdu, vec![0x03, 0x02, 0x00, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn no_oob_auth_value_is_zero() {
        assert_eq!(auth_value(&AuthSelection::NoOob, None).unwrap(), [0u8; 16]);
        assert_eq!(auth_value(&AuthSelection::NoOob, Some("ignored")).unwrap(), [0u8; 16]);
    }

    #[test]
    fn oob_methods_need_a_value() {
        assert!(matches!(
            auth_value(&AuthSelection::StaticOob, None),
            Err(ProvisioningError::InvalidInput(_))
        ));
        let selection = AuthSelection::OutputOob {
            action: OutputOobAction::OutputNumeric,
            size: 4,
        };
        assert_eq!(
            auth_value(&selection, Some("42")).unwrap(),
            oob::numeric_auth_value(42)
        );
    }

    #[test]
    fn input_value_matches_its_auth_value() {
        let selection = AuthSelection::InputOob {
            action: InputOobAction::InputAlphanumeric,
            size: 6,
        };
        let (value, auth) = input_oob_value(&selection).unwrap().unwrap();
        assert_eq!(value.len(), 6);
        assert_eq!(&auth[..6], value.as_bytes());
        assert!(input_oob_value(&AuthSelection::NoOob).unwrap().is_none());
    }

    #[test]
    fn reflected_public_key_is_rejected() {
        let key_pair = KeyPair::generate();
        let reflected = build_public_key(&key_pair);
        assert!(matches!(
            parse_public_key(&reflected, &key_pair),
            Err(ProvisioningError::InvalidPublicKey)
        ));
    }
}
