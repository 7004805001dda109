//! Per-attempt session record, provisioning payload and the provisioned node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::capabilities::{AuthSelection, Capabilities};
use crate::crypto::{self, Key, KeyPair, SharedSecret};
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::oob::AuthValue;
use crate::pdu::{PduType, PROVISIONING_DATA_LEN, PUBLIC_KEY_LEN, VALUE_LEN};

/// Highest valid unicast address.
pub const MAX_UNICAST_ADDRESS: u16 = 0x7FFF;

/// Largest 12-bit key index.
pub const MAX_KEY_INDEX: u16 = 0x0FFF;

/// Key Refresh flag.
pub const FLAG_KEY_REFRESH: u8 = 0x01;

/// IV Update flag.
pub const FLAG_IV_UPDATE: u8 = 0x02;

/// Network credentials delivered in the Provisioning Data PDU.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningData {
    #[serde(with = "hex::serde")]
    pub network_key: Key,
    pub key_index: u16,
    #[serde(default)]
    pub flags: u8,
    #[serde(default)]
    pub iv_index: u32,
    pub unicast_address: u16,
}

impl ProvisioningData {
    pub fn new(network_key: Key, key_index: u16, unicast_address: u16) -> Self {
        Self {
            network_key,
            key_index,
            flags: 0,
            iv_index: 0,
            unicast_address,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_iv_index(mut self, iv_index: u32) -> Self {
        self.iv_index = iv_index;
        self
    }

    /// Check field ranges before anything is sent.
    pub fn validate(&self) -> ProvisioningResult<()> {
        if self.key_index > MAX_KEY_INDEX {
            return Err(ProvisioningError::InvalidInput(format!(
                "key index {:#x} does not fit in 12 bits",
                self.key_index
            )));
        }
        if !is_unicast(self.unicast_address) {
            return Err(ProvisioningError::InvalidInput(format!(
                "{:#06x} is not a unicast address",
                self.unicast_address
            )));
        }
        if self.flags & !(FLAG_KEY_REFRESH | FLAG_IV_UPDATE) != 0 {
            return Err(ProvisioningError::InvalidInput(format!(
                "unknown flag bits in {:#04x}",
                self.flags
            )));
        }
        Ok(())
    }

    /// Check that every element of the node gets a unicast address.
    pub fn validate_for_elements(&self, element_count: u8) -> ProvisioningResult<()> {
        self.validate()?;
        let last = u32::from(self.unicast_address) + u32::from(element_count) - 1;
        if element_count == 0 || last > u32::from(MAX_UNICAST_ADDRESS) {
            return Err(ProvisioningError::CannotAssignAddresses(format!(
                "cannot assign {element_count} addresses from {:#06x}",
                self.unicast_address
            )));
        }
        Ok(())
    }

    /// `NetKey || KeyIndex || Flags || IVIndex || UnicastAddress`.
    pub fn to_bytes(&self) -> [u8; PROVISIONING_DATA_LEN] {
        let mut out = [0u8; PROVISIONING_DATA_LEN];
        out[..16].copy_from_slice(&self.network_key);
        out[16..18].copy_from_slice(&self.key_index.to_be_bytes());
        out[18] = self.flags;
        out[19..23].copy_from_slice(&self.iv_index.to_be_bytes());
        out[23..].copy_from_slice(&self.unicast_address.to_be_bytes());
        out
    }

    /// Decode a decrypted payload; the result is validated.
    pub fn from_bytes(bytes: &[u8; PROVISIONING_DATA_LEN]) -> ProvisioningResult<Self> {
        let mut network_key = [0u8; 16];
        network_key.copy_from_slice(&bytes[..16]);
        let data = Self {
            network_key,
            key_index: u16::from_be_bytes([bytes[16], bytes[17]]),
            flags: bytes[18],
            iv_index: u32::from_be_bytes([bytes[19], bytes[20], bytes[21], bytes[22]]),
            unicast_address: u16::from_be_bytes([bytes[23], bytes[24]]),
        };
        data.validate().map_err(|e| ProvisioningError::InvalidValue {
            pdu: PduType::Data,
            reason: e.to_string(),
        })?;
        Ok(data)
    }
}

impl std::fmt::Debug for ProvisioningData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningData")
            .field("key_index", &self.key_index)
            .field("flags", &self.flags)
            .field("iv_index", &self.iv_index)
            .field("unicast_address", &format_args!("{:#06x}", self.unicast_address))
            .finish_non_exhaustive()
    }
}

impl Drop for ProvisioningData {
    fn drop(&mut self) {
        self.network_key.zeroize();
    }
}

pub fn is_unicast(address: u16) -> bool {
    (0x0001..=MAX_UNICAST_ADDRESS).contains(&address)
}

/// A node admitted to the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNode {
    pub uuid: Uuid,
    pub unicast_address: u16,
    pub element_count: u8,
    #[serde(with = "hex::serde")]
    pub device_key: Key,
    #[serde(with = "hex::serde")]
    pub network_key: Key,
    pub key_index: u16,
    pub flags: u8,
    pub iv_index: u32,
    #[serde(with = "hex::serde")]
    pub identity_key: Key,
    #[serde(with = "hex::serde")]
    pub network_id: [u8; 8],
    pub provisioned_at: DateTime<Utc>,
}

/// Generates a checked getter and a setter for an optional session field.
macro_rules! session_fields {
    ($($field:ident / $setter:ident : $ty:ty),* $(,)?) => {
        $(
            pub fn $field(&self) -> ProvisioningResult<&$ty> {
                self.$field
                    .as_ref()
                    .ok_or(ProvisioningError::MissingField(stringify!($field)))
            }

            pub fn $setter(&mut self, value: $ty) {
                self.$field = Some(value);
            }
        )*
    };
}

/// Everything learned or generated during one provisioning attempt.
///
/// Used by both roles: "local" is the side owning the session, "peer" the
/// other one. Reading a field before the step that populates it fails with
/// [`ProvisioningError::MissingField`]. Key material is wiped on drop.
pub struct Session {
    device_uuid: Uuid,
    data: Option<ProvisioningData>,

    invite_pdu: Option<Vec<u8>>,
    capabilities_pdu: Option<Vec<u8>>,
    start_pdu: Option<Vec<u8>>,
    capabilities: Option<Capabilities>,
    selection: Option<AuthSelection>,

    key_pair: Option<KeyPair>,
    peer_public_key: Option<[u8; PUBLIC_KEY_LEN]>,
    shared_secret: Option<SharedSecret>,

    local_random: Option<[u8; VALUE_LEN]>,
    peer_random: Option<[u8; VALUE_LEN]>,
    auth_value: Option<AuthValue>,
    oob_value: Option<String>,
    peer_confirmation: Option<[u8; VALUE_LEN]>,
    confirmation_salt: Option<Key>,
    device_key: Option<Key>,

    provisioned_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Session for the provisioner, which knows the payload up front.
    pub fn new(device_uuid: Uuid, data: ProvisioningData) -> Self {
        let mut session = Self::for_device(device_uuid);
        session.data = Some(data);
        session
    }

    /// Session for the device, which learns the payload last.
    pub fn for_device(device_uuid: Uuid) -> Self {
        Self {
            device_uuid,
            data: None,
            invite_pdu: None,
            capabilities_pdu: None,
            start_pdu: None,
            capabilities: None,
            selection: None,
            key_pair: None,
            peer_public_key: None,
            shared_secret: None,
            local_random: None,
            peer_random: None,
            auth_value: None,
            oob_value: None,
            peer_confirmation: None,
            confirmation_salt: None,
            device_key: None,
            provisioned_at: None,
        }
    }

    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }

    session_fields! {
        data / set_data: ProvisioningData,
        invite_pdu / set_invite_pdu: Vec<u8>,
        capabilities_pdu / set_capabilities_pdu: Vec<u8>,
        start_pdu / set_start_pdu: Vec<u8>,
        capabilities / set_capabilities: Capabilities,
        selection / set_selection: AuthSelection,
        key_pair / set_key_pair: KeyPair,
        peer_public_key / set_peer_public_key: [u8; PUBLIC_KEY_LEN],
        shared_secret / set_shared_secret: SharedSecret,
        local_random / set_local_random: [u8; VALUE_LEN],
        peer_random / set_peer_random: [u8; VALUE_LEN],
        auth_value / set_auth_value: AuthValue,
        oob_value / set_oob_value: String,
        peer_confirmation / set_peer_confirmation: [u8; VALUE_LEN],
        confirmation_salt / set_confirmation_salt: Key,
        device_key / set_device_key: Key,
    }

    /// Whether the attempt reached Complete.
    pub fn is_provisioned(&self) -> bool {
        self.provisioned_at.is_some()
    }

    pub fn provisioned_at(&self) -> Option<DateTime<Utc>> {
        self.provisioned_at
    }

    pub fn mark_provisioned(&mut self, at: DateTime<Utc>) {
        self.provisioned_at = Some(at);
    }

    /// Outcome record once the session is provisioned.
    pub fn provisioned_node(&self) -> ProvisioningResult<ProvisionedNode> {
        let provisioned_at = self
            .provisioned_at
            .ok_or(ProvisioningError::MissingField("provisioned_at"))?;
        let data = self.data()?;

        Ok(ProvisionedNode {
            uuid: self.device_uuid,
            unicast_address: data.unicast_address,
            element_count: self.capabilities()?.element_count,
            device_key: *self.device_key()?,
            network_key: data.network_key,
            key_index: data.key_index,
            flags: data.flags,
            iv_index: data.iv_index,
            identity_key: crypto::identity_key(&data.network_key),
            network_id: crypto::network_id(&data.network_key),
            provisioned_at,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device_uuid", &self.device_uuid)
            .field("selection", &self.selection)
            .field("provisioned_at", &self.provisioned_at)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
        self.local_random.zeroize();
        self.peer_random.zeroize();
        self.auth_value.zeroize();
        self.oob_value.zeroize();
        self.confirmation_salt.zeroize();
        self.device_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn sample_data() -> ProvisioningData {
        ProvisioningData::new(hex!("efb2255e6422d330088e09bb015ed707"), 0x0567, 0x0b0c)
            .with_flags(FLAG_KEY_REFRESH)
            .with_iv_index(0x0102_0304)
    }

    #[test]
    fn payload_layout() {
        let bytes = sample_data().to_bytes();
        assert_eq!(&bytes[..16], &hex!("efb2255e6422d330088e09bb015ed707"));
        assert_eq!(&bytes[16..], &hex!("0567 01 01020304 0b0c"));
        assert_eq!(ProvisioningData::from_bytes(&bytes).unwrap(), sample_data());
    }

    #[test]
    fn payload_validation() {
        let key = [1u8; 16];
        assert!(ProvisioningData::new(key, 0x1000, 1).validate().is_err());
        assert!(ProvisioningData::new(key, 0, 0).validate().is_err());
        assert!(ProvisioningData::new(key, 0, 0x8000).validate().is_err());
        assert!(ProvisioningData::new(key, 0, 1).with_flags(0x04).validate().is_err());
        assert!(ProvisioningData::new(key, 0xFFF, 0x7FFF)
            .with_flags(FLAG_KEY_REFRESH | FLAG_IV_UPDATE)
            .validate()
            .is_ok());
    }

    #[test]
    fn addresses_for_all_elements() {
        let data = ProvisioningData::new([1u8; 16], 0, 0x7FFE);
        assert!(data.validate_for_elements(2).is_ok());
        assert!(matches!(
            data.validate_for_elements(3),
            Err(ProvisioningError::CannotAssignAddresses(_))
        ));
    }

    #[test]
    fn decoded_payload_is_validated() {
        let mut bytes = sample_data().to_bytes();
        bytes[23] = 0x80;
        assert!(matches!(
            ProvisioningData::from_bytes(&bytes),
            Err(ProvisioningError::InvalidValue { pdu: PduType::Data, .. })
        ));
    }

    #[test]
    fn unpopulated_fields_are_reported() {
        let session = Session::new(Uuid::new_v4(), sample_data());
        assert!(matches!(
            session.shared_secret(),
            Err(ProvisioningError::MissingField("shared_secret"))
        ));
        assert!(matches!(
            session.provisioned_node(),
            Err(ProvisioningError::MissingField("provisioned_at"))
        ));
        assert!(Session::for_device(Uuid::nil()).data().is_err());
    }

    #[test]
    fn provisioned_node_carries_derived_keys() {
        let uuid = Uuid::new_v4();
        let mut session = Session::new(uuid, sample_data());
        session.set_capabilities(Capabilities::new(3));
        session.set_device_key([9u8; 16]);
        let now = Utc::now();
        session.mark_provisioned(now);

        let node = session.provisioned_node().unwrap();
        assert_eq!(node.uuid, uuid);
        assert_eq!(node.element_count, 3);
        assert_eq!(node.device_key, [9u8; 16]);
        assert_eq!(node.identity_key, crypto::identity_key(&sample_data().network_key));
        assert_eq!(node.network_id, crypto::network_id(&sample_data().network_key));
        assert_eq!(node.provisioned_at, now);

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["network_key"], "efb2255e6422d330088e09bb015ed707");
    }

    #[test]
    fn debug_hides_network_key() {
        let rendered = format!("{:?}", sample_data());
        assert!(!rendered.contains("efb2"));
        assert!(rendered.contains("0x0b0c"));
    }
}
