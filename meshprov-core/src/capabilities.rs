//! Device capabilities and authentication method selection.
//!
//! Bit assignments follow Mesh Profile 1.0.1 section 5.4.1.2. Bitmasks are
//! decoded least significant bit first and unknown bits are ignored.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::pdu::{self, PduType, HEADER_LEN};

/// Provisioning algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Algorithm {
    /// FIPS P-256 elliptic curve.
    FipsP256 = 0x00,
}

impl Algorithm {
    pub const ALL: [Self; 1] = [Self::FipsP256];

    pub fn from_byte(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| *a as u8 == value)
    }
}

/// Output OOB actions, by bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OutputOobAction {
    Blink = 0,
    Beep = 1,
    Vibrate = 2,
    OutputNumeric = 3,
    OutputAlphanumeric = 4,
}

impl OutputOobAction {
    pub const ALL: [Self; 5] = [
        Self::Blink,
        Self::Beep,
        Self::Vibrate,
        Self::OutputNumeric,
        Self::OutputAlphanumeric,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| *a as u8 == index)
    }

    /// Kind of value the device presents for this action.
    pub fn value_kind(self) -> OobValueKind {
        match self {
            Self::Blink | Self::Beep | Self::Vibrate => OobValueKind::Count,
            Self::OutputNumeric => OobValueKind::Numeric,
            Self::OutputAlphanumeric => OobValueKind::Alphanumeric,
        }
    }
}

/// Input OOB actions, by bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InputOobAction {
    Push = 0,
    Twist = 1,
    InputNumeric = 2,
    InputAlphanumeric = 3,
}

impl InputOobAction {
    pub const ALL: [Self; 4] = [
        Self::Push,
        Self::Twist,
        Self::InputNumeric,
        Self::InputAlphanumeric,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| *a as u8 == index)
    }

    /// Kind of value the user enters on the device for this action.
    pub fn value_kind(self) -> OobValueKind {
        match self {
            Self::Push | Self::Twist => OobValueKind::Count,
            Self::InputNumeric => OobValueKind::Numeric,
            Self::InputAlphanumeric => OobValueKind::Alphanumeric,
        }
    }
}

/// How an output/input OOB value is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OobValueKind {
    /// Number of blinks, beeps, pushes... never zero.
    Count,
    /// Decimal number of up to `size` digits.
    Numeric,
    /// `size` characters from `0-9A-Z`.
    Alphanumeric,
}

/// Authentication methods carried in the Start PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AuthMethod {
    NoOob = 0x00,
    StaticOob = 0x01,
    OutputOob = 0x02,
    InputOob = 0x03,
}

impl AuthMethod {
    pub fn from_byte(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::NoOob,
            0x01 => Self::StaticOob,
            0x02 => Self::OutputOob,
            0x03 => Self::InputOob,
            _ => return None,
        })
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = ProvisioningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "none" | "nooob" => Ok(Self::NoOob),
            "static" | "staticoob" => Ok(Self::StaticOob),
            "output" | "outputoob" => Ok(Self::OutputOob),
            "input" | "inputoob" => Ok(Self::InputOob),
            _ => Err(ProvisioningError::InvalidInput(format!(
                "unknown authentication method '{s}'"
            ))),
        }
    }
}

/// A concrete authentication choice: method plus action and size where the
/// method needs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum AuthSelection {
    NoOob,
    StaticOob,
    OutputOob { action: OutputOobAction, size: u8 },
    InputOob { action: InputOobAction, size: u8 },
}

impl AuthSelection {
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::NoOob => AuthMethod::NoOob,
            Self::StaticOob => AuthMethod::StaticOob,
            Self::OutputOob { .. } => AuthMethod::OutputOob,
            Self::InputOob { .. } => AuthMethod::InputOob,
        }
    }
}

/// Parsed Provisioning Capabilities PDU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub element_count: u8,
    pub algorithms: BTreeSet<Algorithm>,
    pub public_key_oob: bool,
    pub static_oob: bool,
    pub output_oob_size: u8,
    pub output_oob_actions: BTreeSet<OutputOobAction>,
    pub input_oob_size: u8,
    pub input_oob_actions: BTreeSet<InputOobAction>,
}

impl Capabilities {
    /// Minimal capabilities: FIPS P-256 and no OOB at all.
    pub fn new(element_count: u8) -> Self {
        Self {
            element_count,
            algorithms: BTreeSet::from([Algorithm::FipsP256]),
            public_key_oob: false,
            static_oob: false,
            output_oob_size: 0,
            output_oob_actions: BTreeSet::new(),
            input_oob_size: 0,
            input_oob_actions: BTreeSet::new(),
        }
    }

    /// Advertise static OOB.
    pub fn with_static_oob(mut self) -> Self {
        self.static_oob = true;
        self
    }

    /// Advertise output OOB. A zero size clears the action set.
    pub fn with_output_oob(
        mut self,
        size: u8,
        actions: impl IntoIterator<Item = OutputOobAction>,
    ) -> Self {
        self.output_oob_size = size;
        self.output_oob_actions = if size == 0 {
            BTreeSet::new()
        } else {
            actions.into_iter().collect()
        };
        self
    }

    /// Advertise input OOB. A zero size clears the action set.
    pub fn with_input_oob(
        mut self,
        size: u8,
        actions: impl IntoIterator<Item = InputOobAction>,
    ) -> Self {
        self.input_oob_size = size;
        self.input_oob_actions = if size == 0 {
            BTreeSet::new()
        } else {
            actions.into_iter().collect()
        };
        self
    }

    /// Decode a capabilities PDU (header included).
    pub fn parse(pdu: &[u8]) -> ProvisioningResult<Self> {
        let ty = pdu::pdu_type(pdu)?;
        if ty != PduType::Capabilities {
            return Err(ProvisioningError::UnexpectedPdu {
                expected: PduType::Capabilities,
                received: ty,
            });
        }

        let expected = PduType::Capabilities.pdu_len();
        if pdu.len() < expected {
            return Err(ProvisioningError::InvalidLength {
                pdu: PduType::Capabilities,
                expected,
                actual: pdu.len(),
            });
        }

        let p = &pdu[HEADER_LEN..];
        let element_count = p[0];
        if element_count == 0 {
            return Err(ProvisioningError::NoElements);
        }

        let algorithms = u16::from_be_bytes([p[1], p[2]]);
        let public_key_type = p[3];
        let static_oob_type = p[4];
        let output_oob_size = p[5];
        let output_actions = u16::from_be_bytes([p[6], p[7]]);
        let input_oob_size = p[8];
        let input_actions = u16::from_be_bytes([p[9], p[10]]);

        let caps = Self {
            element_count,
            algorithms: decode_bits(algorithms, &Algorithm::ALL[..], |a| a as u8),
            public_key_oob: public_key_type & 0x01 != 0,
            static_oob: static_oob_type & 0x01 != 0,
            output_oob_size,
            output_oob_actions: BTreeSet::new(),
            input_oob_size,
            input_oob_actions: BTreeSet::new(),
        };
        Ok(caps
            .with_output_oob(
                output_oob_size,
                decode_bits(output_actions, &OutputOobAction::ALL[..], |a| a as u8),
            )
            .with_input_oob(
                input_oob_size,
                decode_bits(input_actions, &InputOobAction::ALL[..], |a| a as u8),
            ))
    }

    /// Encode as a capabilities PDU.
    pub fn to_pdu(&self) -> Vec<u8> {
        let mut out = PduType::Capabilities.header().to_vec();
        self.encode(&mut out);
        out
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.element_count);
        out.extend_from_slice(&encode_bits(self.algorithms.iter().map(|a| *a as u8)).to_be_bytes());
        out.push(u8::from(self.public_key_oob));
        out.push(u8::from(self.static_oob));
        out.push(self.output_oob_size);
        out.extend_from_slice(
            &encode_bits(self.output_oob_actions.iter().map(|a| *a as u8)).to_be_bytes(),
        );
        out.push(self.input_oob_size);
        out.extend_from_slice(
            &encode_bits(self.input_oob_actions.iter().map(|a| *a as u8)).to_be_bytes(),
        );
    }

    /// Authentication methods this device can be provisioned with.
    pub fn auth_methods(&self) -> BTreeSet<AuthMethod> {
        let mut methods = BTreeSet::from([AuthMethod::NoOob]);
        if self.static_oob {
            methods.insert(AuthMethod::StaticOob);
        }
        if !self.output_oob_actions.is_empty() {
            methods.insert(AuthMethod::OutputOob);
        }
        if !self.input_oob_actions.is_empty() {
            methods.insert(AuthMethod::InputOob);
        }
        methods
    }

    /// Build a selection for `method` using the first advertised action and
    /// the largest advertised size.
    pub fn selection_for(&self, method: AuthMethod) -> ProvisioningResult<AuthSelection> {
        let selection = match method {
            AuthMethod::NoOob => AuthSelection::NoOob,
            AuthMethod::StaticOob => AuthSelection::StaticOob,
            AuthMethod::OutputOob => AuthSelection::OutputOob {
                action: self.output_oob_actions.first().copied().ok_or_else(|| {
                    ProvisioningError::UnsupportedMethod("no output OOB actions".into())
                })?,
                size: self.output_oob_size,
            },
            AuthMethod::InputOob => AuthSelection::InputOob {
                action: self.input_oob_actions.first().copied().ok_or_else(|| {
                    ProvisioningError::UnsupportedMethod("no input OOB actions".into())
                })?,
                size: self.input_oob_size,
            },
        };
        self.validate_selection(&selection)?;
        Ok(selection)
    }

    /// Check a selection against what the device advertised.
    pub fn validate_selection(&self, selection: &AuthSelection) -> ProvisioningResult<()> {
        let method = selection.method();
        if !self.auth_methods().contains(&method) {
            return Err(ProvisioningError::UnsupportedMethod(format!("{method:?}")));
        }
        match *selection {
            AuthSelection::NoOob | AuthSelection::StaticOob => Ok(()),
            AuthSelection::OutputOob { action, size } => {
                if !self.output_oob_actions.contains(&action) {
                    return Err(ProvisioningError::UnsupportedMethod(format!(
                        "output action {action:?}"
                    )));
                }
                check_size(size, self.output_oob_size)
            }
            AuthSelection::InputOob { action, size } => {
                if !self.input_oob_actions.contains(&action) {
                    return Err(ProvisioningError::UnsupportedMethod(format!(
                        "input action {action:?}"
                    )));
                }
                check_size(size, self.input_oob_size)
            }
        }
    }
}

fn check_size(size: u8, advertised: u8) -> ProvisioningResult<()> {
    pdu::checked_oob_size(size).map_err(ProvisioningError::InvalidInput)?;
    if size > advertised {
        return Err(ProvisioningError::UnsupportedMethod(format!(
            "OOB size {size} exceeds advertised {advertised}"
        )));
    }
    Ok(())
}

fn decode_bits<T: Copy + Ord>(mask: u16, all: &[T], index: impl Fn(T) -> u8) -> BTreeSet<T> {
    all.iter()
        .copied()
        .filter(|v| mask & (1 << index(*v)) != 0)
        .collect()
}

fn encode_bits(indices: impl Iterator<Item = u8>) -> u16 {
    indices.fold(0u16, |mask, i| mask | (1 << i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn caps_pdu(elements: u8, static_oob: u8, out_size: u8, out_actions: u16, in_size: u8, in_actions: u16) -> Vec<u8> {
        let mut pdu = vec![0x03, 0x01, elements, 0x00, 0x01, 0x00, static_oob, out_size];
        pdu.extend_from_slice(&out_actions.to_be_bytes());
        pdu.push(in_size);
        pdu.extend_from_slice(&in_actions.to_be_bytes());
        pdu
    }

    #[test]
    fn parse_full_capabilities() {
        let caps = Capabilities::parse(&caps_pdu(2, 0x01, 4, 0b0_1001, 6, 0b0100)).unwrap();
        assert_eq!(caps.element_count, 2);
        assert_eq!(caps.algorithms, BTreeSet::from([Algorithm::FipsP256]));
        assert!(caps.static_oob);
        assert!(!caps.public_key_oob);
        assert_eq!(
            caps.output_oob_actions,
            BTreeSet::from([OutputOobAction::Blink, OutputOobAction::OutputNumeric])
        );
        assert_eq!(caps.input_oob_actions, BTreeSet::from([InputOobAction::InputNumeric]));
        assert_eq!(
            caps.auth_methods(),
            BTreeSet::from([
                AuthMethod::NoOob,
                AuthMethod::StaticOob,
                AuthMethod::OutputOob,
                AuthMethod::InputOob
            ])
        );
    }

    #[test]
    fn zero_elements_rejected() {
        assert!(matches!(
            Capabilities::parse(&caps_pdu(0, 0, 0, 0, 0, 0)),
            Err(ProvisioningError::NoElements)
        ));
    }

    #[test]
    fn short_pdu_rejected() {
        let pdu = caps_pdu(1, 0, 0, 0, 0, 0);
        assert!(matches!(
            Capabilities::parse(&pdu[..12]),
            Err(ProvisioningError::InvalidLength { expected: 13, actual: 12, .. })
        ));
    }

    #[test]
    fn zero_size_clears_actions() {
        let caps = Capabilities::parse(&caps_pdu(1, 0, 0, 0b1_1111, 0, 0b1111)).unwrap();
        assert!(caps.output_oob_actions.is_empty());
        assert!(caps.input_oob_actions.is_empty());
        assert_eq!(caps.auth_methods(), BTreeSet::from([AuthMethod::NoOob]));
    }

    #[test]
    fn unknown_bits_ignored() {
        let caps = Capabilities::parse(&caps_pdu(1, 0xFE, 2, 0xFFE0, 2, 0xFFF0)).unwrap();
        assert!(!caps.static_oob);
        assert!(caps.output_oob_actions.is_empty());
        assert!(caps.input_oob_actions.is_empty());
    }

    #[test]
    fn builder_round_trips_through_pdu() {
        let caps = Capabilities::new(3)
            .with_static_oob()
            .with_output_oob(4, [OutputOobAction::OutputAlphanumeric])
            .with_input_oob(2, [InputOobAction::Push, InputOobAction::Twist]);
        assert_eq!(Capabilities::parse(&caps.to_pdu()).unwrap(), caps);
    }

    #[test]
    fn selection_validation() {
        let caps = Capabilities::new(1).with_output_oob(4, [OutputOobAction::Beep]);

        assert!(caps.validate_selection(&AuthSelection::NoOob).is_ok());
        assert!(caps.validate_selection(&AuthSelection::StaticOob).is_err());
        assert!(caps
            .validate_selection(&AuthSelection::OutputOob {
                action: OutputOobAction::Beep,
                size: 4
            })
            .is_ok());
        assert!(caps
            .validate_selection(&AuthSelection::OutputOob {
                action: OutputOobAction::Beep,
                size: 5
            })
            .is_err());
        assert!(caps
            .validate_selection(&AuthSelection::OutputOob {
                action: OutputOobAction::Blink,
                size: 1
            })
            .is_err());

        assert_eq!(
            caps.selection_for(AuthMethod::OutputOob).unwrap(),
            AuthSelection::OutputOob {
                action: OutputOobAction::Beep,
                size: 4
            }
        );
        assert!(caps.selection_for(AuthMethod::InputOob).is_err());
    }

    #[test]
    fn auth_method_from_str() {
        assert_eq!("none".parse::<AuthMethod>().unwrap(), AuthMethod::NoOob);
        assert_eq!("Static-OOB".parse::<AuthMethod>().unwrap(), AuthMethod::StaticOob);
        assert_eq!("input".parse::<AuthMethod>().unwrap(), AuthMethod::InputOob);
        assert!("fingerprint".parse::<AuthMethod>().is_err());
    }

    proptest! {
        #[test]
        fn decoding_is_idempotent_and_methods_follow_flags(
            elements in 1u8..=255,
            static_oob in any::<u8>(),
            out_size in any::<u8>(),
            out_actions in any::<u16>(),
            in_size in any::<u8>(),
            in_actions in any::<u16>(),
        ) {
            let pdu = caps_pdu(elements, static_oob, out_size, out_actions, in_size, in_actions);
            let first = Capabilities::parse(&pdu).unwrap();
            let second = Capabilities::parse(&pdu).unwrap();
            prop_assert_eq!(&first, &second);

            let mut expected = BTreeSet::from([AuthMethod::NoOob]);
            if static_oob & 0x01 != 0 {
                expected.insert(AuthMethod::StaticOob);
            }
            if out_size != 0 && out_actions & 0x1F != 0 {
                expected.insert(AuthMethod::OutputOob);
            }
            if in_size != 0 && in_actions & 0x0F != 0 {
                expected.insert(AuthMethod::InputOob);
            }
            prop_assert_eq!(first.auth_methods(), expected);
        }

        #[test]
        fn zero_element_count_always_fails(rest in proptest::collection::vec(any::<u8>(), 10..20)) {
            let mut pdu = vec![0x03, 0x01, 0x00];
            pdu.extend_from_slice(&rest);
            prop_assert!(matches!(Capabilities::parse(&pdu), Err(ProvisioningError::NoElements)));
        }
    }
}
