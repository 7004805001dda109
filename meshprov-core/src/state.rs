//! State machine definitions for mesh provisioning.
//!
//! Defines the provisioner and device state automata and the observer hook
//! notified on every transition.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pdu::PduType;

/// Provisioner state automaton states. Each state names the step just
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningState {
    /// Initial state - nothing sent yet.
    Idle,
    InviteSent,
    CapabilitiesReceived,
    StartSent,
    PublicKeySent,
    PublicKeyReceived,
    /// Device signalled the input OOB value was entered.
    InputCompleteReceived,
    ConfirmationSent,
    ConfirmationReceived,
    RandomSent,
    /// Device random received and its confirmation verified.
    RandomReceived,
    DataSent,
    /// Terminal state - device accepted the data.
    Complete,
    /// Error state - unrecoverable failure.
    Failed,
}

impl ProvisioningState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Get valid transitions from current state.
    pub fn valid_transitions(&self) -> &'static [ProvisioningState] {
        match self {
            Self::Idle => &[Self::InviteSent, Self::Failed],
            Self::InviteSent => &[Self::CapabilitiesReceived, Self::Failed],
            Self::CapabilitiesReceived => &[Self::StartSent, Self::Failed],
            Self::StartSent => &[Self::PublicKeySent, Self::Failed],
            Self::PublicKeySent => &[Self::PublicKeyReceived, Self::Failed],
            Self::PublicKeyReceived => &[
                Self::InputCompleteReceived,
                Self::ConfirmationSent,
                Self::Failed,
            ],
            Self::InputCompleteReceived => &[Self::ConfirmationSent, Self::Failed],
            Self::ConfirmationSent => &[Self::ConfirmationReceived, Self::Failed],
            Self::ConfirmationReceived => &[Self::RandomSent, Self::Failed],
            Self::RandomSent => &[Self::RandomReceived, Self::Failed],
            Self::RandomReceived => &[Self::DataSent, Self::Failed],
            Self::DataSent => &[Self::Complete, Self::Failed],
            Self::Complete => &[],
            Self::Failed => &[],
        }
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: ProvisioningState) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Inbound PDU the provisioner waits for in this state, if any.
    pub fn expected_pdu(&self) -> Option<PduType> {
        match self {
            Self::InviteSent => Some(PduType::Capabilities),
            Self::PublicKeySent => Some(PduType::PublicKey),
            Self::ConfirmationSent => Some(PduType::Confirmation),
            Self::RandomSent => Some(PduType::Random),
            Self::DataSent => Some(PduType::Complete),
            _ => None,
        }
    }
}

/// Device (provisionee) state automaton states. Each state names the PDU
/// the device waits for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    AwaitingInvite,
    AwaitingStart,
    AwaitingPublicKey,
    /// Waiting for the user to enter the input OOB value.
    AwaitingInput,
    AwaitingConfirmation,
    AwaitingRandom,
    AwaitingData,
    /// Terminal state - credentials stored.
    Complete,
    /// Error state.
    Failed,
}

impl DeviceState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Get valid transitions from current state.
    pub fn valid_transitions(&self) -> &'static [DeviceState] {
        match self {
            Self::AwaitingInvite => &[Self::AwaitingStart, Self::Failed],
            Self::AwaitingStart => &[Self::AwaitingPublicKey, Self::Failed],
            Self::AwaitingPublicKey => &[Self::AwaitingInput, Self::AwaitingConfirmation, Self::Failed],
            Self::AwaitingInput => &[Self::AwaitingConfirmation, Self::Failed],
            Self::AwaitingConfirmation => &[Self::AwaitingRandom, Self::Failed],
            Self::AwaitingRandom => &[Self::AwaitingData, Self::Failed],
            Self::AwaitingData => &[Self::Complete, Self::Failed],
            Self::Complete => &[],
            Self::Failed => &[],
        }
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: DeviceState) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Inbound PDU the device accepts in this state.
    pub fn expected_pdu(&self) -> Option<PduType> {
        match self {
            Self::AwaitingInvite => Some(PduType::Invite),
            Self::AwaitingStart => Some(PduType::Start),
            Self::AwaitingPublicKey => Some(PduType::PublicKey),
            Self::AwaitingConfirmation => Some(PduType::Confirmation),
            Self::AwaitingRandom => Some(PduType::Random),
            Self::AwaitingData => Some(PduType::Data),
            Self::AwaitingInput | Self::Complete | Self::Failed => None,
        }
    }
}

/// Notification emitted after every outbound build and inbound parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub device_uuid: Uuid,
    pub state: ProvisioningState,
    /// PDU built or parsed by the step, absent for local aborts.
    pub pdu: Option<PduType>,
    /// Raw bytes of that PDU, header included.
    pub pdu_bytes: Option<Vec<u8>>,
}

/// Hook for callers that want to follow provisioning progress.
pub trait ProvisioningObserver: Send + Sync {
    fn on_state_changed(&self, change: &StateChange);
}

/// Observer that logs each transition through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProvisioningObserver for TracingObserver {
    fn on_state_changed(&self, change: &StateChange) {
        tracing::info!(
            device = %change.device_uuid,
            state = ?change.state,
            pdu = ?change.pdu,
            bytes = %change.pdu_bytes.as_deref().map(hex::encode).unwrap_or_default(),
            "provisioning state changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioner_state_transitions() {
        let state = ProvisioningState::Idle;
        assert!(state.can_transition_to(ProvisioningState::InviteSent));
        assert!(state.can_transition_to(ProvisioningState::Failed));
        assert!(!state.can_transition_to(ProvisioningState::StartSent));

        let keys = ProvisioningState::PublicKeyReceived;
        assert!(keys.can_transition_to(ProvisioningState::InputCompleteReceived));
        assert!(keys.can_transition_to(ProvisioningState::ConfirmationSent));
        assert!(!keys.can_transition_to(ProvisioningState::RandomSent));
    }

    #[test]
    fn data_only_after_verified_random() {
        for state in [
            ProvisioningState::ConfirmationSent,
            ProvisioningState::ConfirmationReceived,
            ProvisioningState::RandomSent,
        ] {
            assert!(!state.can_transition_to(ProvisioningState::DataSent));
        }
        assert!(ProvisioningState::RandomReceived.can_transition_to(ProvisioningState::DataSent));
    }

    #[test]
    fn no_state_is_reentrant() {
        let all = [
            ProvisioningState::Idle,
            ProvisioningState::InviteSent,
            ProvisioningState::CapabilitiesReceived,
            ProvisioningState::StartSent,
            ProvisioningState::PublicKeySent,
            ProvisioningState::PublicKeyReceived,
            ProvisioningState::InputCompleteReceived,
            ProvisioningState::ConfirmationSent,
            ProvisioningState::ConfirmationReceived,
            ProvisioningState::RandomSent,
            ProvisioningState::RandomReceived,
            ProvisioningState::DataSent,
            ProvisioningState::Complete,
            ProvisioningState::Failed,
        ];
        for state in all {
            assert!(!state.can_transition_to(state));
            if !state.is_terminal() {
                assert!(state.can_transition_to(ProvisioningState::Failed));
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(ProvisioningState::Complete.is_terminal());
        assert!(ProvisioningState::Failed.is_terminal());
        assert!(!ProvisioningState::DataSent.is_terminal());
        assert!(DeviceState::Complete.is_terminal());
        assert!(!DeviceState::AwaitingData.is_terminal());
    }

    #[test]
    fn device_state_transitions() {
        let state = DeviceState::AwaitingPublicKey;
        assert!(state.can_transition_to(DeviceState::AwaitingInput));
        assert!(state.can_transition_to(DeviceState::AwaitingConfirmation));
        assert!(!state.can_transition_to(DeviceState::AwaitingData));
        assert_eq!(DeviceState::AwaitingInput.expected_pdu(), None);
        assert_eq!(DeviceState::AwaitingData.expected_pdu(), Some(PduType::Data));
    }

    #[test]
    fn state_serialization() {
        let json = serde_json::to_string(&ProvisioningState::PublicKeySent).unwrap();
        assert_eq!(json, "\"PUBLIC_KEY_SENT\"");
    }
}
