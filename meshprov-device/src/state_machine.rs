//! Device (provisionee) state machine implementation.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use meshprov_core::keys::{self, ConfirmationInputs, SessionKeys};
use meshprov_core::oob;
use meshprov_core::{
    crypto, AuthSelection, DeviceState, InputOobAction, KeyPair, Pdu, PduType, ProvisionedNode,
    ProvisioningData, ProvisioningError, ProvisioningResult, Session,
};

use crate::capability::OobRegistry;

/// Failed PDU reporting `error` to the provisioner.
pub fn failure_pdu(error: &ProvisioningError) -> Vec<u8> {
    Pdu::Failed(error.failure_code()).to_bytes()
}

/// Device state machine handling a single provisioning attempt.
pub struct ProvisioneeStateMachine {
    state: DeviceState,
    device_uuid: Uuid,
    registry: Arc<OobRegistry>,
    session: Option<Session>,
    node: Option<ProvisionedNode>,
}

impl ProvisioneeStateMachine {
    /// Create a new state machine.
    pub fn new(device_uuid: Uuid, registry: Arc<OobRegistry>) -> Self {
        Self {
            state: DeviceState::AwaitingInvite,
            device_uuid,
            registry,
            session: Some(Session::for_device(device_uuid)),
            node: None,
        }
    }

    /// Get current state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Credentials received, once Complete was sent.
    pub fn provisioned_node(&self) -> Option<&ProvisionedNode> {
        self.node.as_ref()
    }

    /// Input action and size the user must satisfy before Input Complete.
    pub fn pending_input(&self) -> Option<(InputOobAction, u8)> {
        if self.state != DeviceState::AwaitingInput {
            return None;
        }
        match self.session.as_ref()?.selection().ok()? {
            AuthSelection::InputOob { action, size } => Some((*action, *size)),
            _ => None,
        }
    }

    /// Process one PDU from the provisioner and return the PDUs to send back.
    ///
    /// On error the machine is `Failed`, the session is gone, and the caller
    /// reports the error with [`failure_pdu`].
    pub fn handle_pdu(&mut self, pdu: &[u8]) -> ProvisioningResult<Vec<Vec<u8>>> {
        if self.state.is_terminal() {
            return Err(ProvisioningError::InvalidTransition(format!(
                "PDU after {:?}",
                self.state
            )));
        }
        let result = self.dispatch(pdu);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// The user entered the input OOB value; returns Input Complete.
    pub fn enter_input(&mut self, value: &str) -> ProvisioningResult<Vec<Vec<u8>>> {
        let result = self.accept_input(value);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn dispatch(&mut self, pdu: &[u8]) -> ProvisioningResult<Vec<Vec<u8>>> {
        let received = meshprov_core::pdu::pdu_type(pdu)?;
        let expected = self.state.expected_pdu().ok_or_else(|| {
            ProvisioningError::InvalidTransition(format!("{received:?} in {:?}", self.state))
        })?;
        if received != expected {
            return Err(ProvisioningError::UnexpectedPdu { expected, received });
        }
        tracing::debug!(device = %self.device_uuid, pdu = ?received, "handling PDU");

        match Pdu::parse(pdu)? {
            Pdu::Invite { attention_timer } => self.on_invite(pdu, attention_timer),
            Pdu::Start(start) => self.on_start(pdu, start.public_key_oob, start.authentication),
            Pdu::PublicKey(xy) => self.on_public_key(xy),
            Pdu::Confirmation(value) => self.on_confirmation(value),
            Pdu::Random(value) => self.on_random(value),
            Pdu::Data(sealed) => self.on_data(&sealed),
            other => Err(ProvisioningError::UnexpectedPdu {
                expected,
                received: other.pdu_type(),
            }),
        }
    }

    fn on_invite(&mut self, pdu: &[u8], attention_timer: u8) -> ProvisioningResult<Vec<Vec<u8>>> {
        tracing::info!(device = %self.device_uuid, attention_timer, "invited");
        let capabilities = self.registry.capabilities().clone();
        let reply = capabilities.to_pdu();

        let session = self.session_mut()?;
        session.set_invite_pdu(pdu.to_vec());
        session.set_capabilities_pdu(reply.clone());
        session.set_capabilities(capabilities);

        self.transition(DeviceState::AwaitingStart)?;
        Ok(vec![reply])
    }

    fn on_start(
        &mut self,
        pdu: &[u8],
        public_key_oob: bool,
        selection: AuthSelection,
    ) -> ProvisioningResult<Vec<Vec<u8>>> {
        if public_key_oob {
            return Err(ProvisioningError::InvalidValue {
                pdu: PduType::Start,
                reason: "OOB public key not available".into(),
            });
        }
        let auth_value = self.registry.auth_value_at_start(&selection)?;

        let session = self.session_mut()?;
        session.set_start_pdu(pdu.to_vec());
        session.set_selection(selection);
        if let Some(value) = auth_value {
            session.set_auth_value(value);
        }

        self.transition(DeviceState::AwaitingPublicKey)?;
        Ok(Vec::new())
    }

    fn on_public_key(&mut self, provisioner_xy: [u8; 64]) -> ProvisioningResult<Vec<Vec<u8>>> {
        let key_pair = KeyPair::generate();
        if &provisioner_xy == key_pair.public_xy() {
            return Err(ProvisioningError::InvalidPublicKey);
        }
        let secret = key_pair.agree(&provisioner_xy)?;
        let reply = Pdu::PublicKey(*key_pair.public_xy()).to_bytes();

        let session = self.session_mut()?;
        session.set_peer_public_key(provisioner_xy);
        session.set_shared_secret(secret);
        session.set_key_pair(key_pair);
        let next = match session.selection()? {
            AuthSelection::InputOob { .. } => DeviceState::AwaitingInput,
            _ => DeviceState::AwaitingConfirmation,
        };

        self.transition(next)?;
        Ok(vec![reply])
    }

    fn accept_input(&mut self, value: &str) -> ProvisioningResult<Vec<Vec<u8>>> {
        let (action, size) = self.pending_input().ok_or_else(|| {
            ProvisioningError::InvalidTransition(format!("input in {:?}", self.state))
        })?;
        let auth_value = oob::auth_value_for(action.value_kind(), size, value)?;
        self.session_mut()?.set_auth_value(auth_value);

        self.transition(DeviceState::AwaitingConfirmation)?;
        Ok(vec![Pdu::InputComplete.to_bytes()])
    }

    fn on_confirmation(&mut self, provisioner_confirmation: [u8; 16]) -> ProvisioningResult<Vec<Vec<u8>>> {
        let session = self.session_mut()?;
        let key_pair = session.key_pair()?;
        let inputs = ConfirmationInputs::new(
            session.invite_pdu()?,
            session.capabilities_pdu()?,
            session.start_pdu()?,
            session.peer_public_key()?,
            key_pair.public_xy(),
        )?;
        let salt = inputs.salt();
        let key = keys::confirmation_key(session.shared_secret()?, &salt);
        let random: [u8; 16] = crypto::random_bytes();
        let confirmation = keys::confirmation_value(&key, &random, session.auth_value()?);

        session.set_peer_confirmation(provisioner_confirmation);
        session.set_confirmation_salt(salt);
        session.set_local_random(random);

        self.transition(DeviceState::AwaitingRandom)?;
        Ok(vec![Pdu::Confirmation(confirmation).to_bytes()])
    }

    fn on_random(&mut self, provisioner_random: [u8; 16]) -> ProvisioningResult<Vec<Vec<u8>>> {
        let session = self.session_mut()?;
        let key = keys::confirmation_key(session.shared_secret()?, session.confirmation_salt()?);
        if !keys::verify_confirmation(
            &key,
            &provisioner_random,
            session.auth_value()?,
            session.peer_confirmation()?,
        ) {
            return Err(ProvisioningError::ConfirmationFailed);
        }
        session.set_peer_random(provisioner_random);
        let reply = Pdu::Random(*session.local_random()?).to_bytes();

        self.transition(DeviceState::AwaitingData)?;
        Ok(vec![reply])
    }

    fn on_data(&mut self, sealed: &[u8; 33]) -> ProvisioningResult<Vec<Vec<u8>>> {
        let session = self.session_mut()?;
        // The peer random on this side is the provisioner's.
        let salt = keys::provisioning_salt(
            session.confirmation_salt()?,
            session.peer_random()?,
            session.local_random()?,
        );
        let session_keys = SessionKeys::derive(session.shared_secret()?, &salt);
        let data = ProvisioningData::from_bytes(&session_keys.open(sealed)?)?;
        data.validate_for_elements(session.capabilities()?.element_count)?;

        session.set_device_key(session_keys.device_key);
        session.set_data(data);
        session.mark_provisioned(Utc::now());
        let node = session.provisioned_node()?;
        tracing::info!(
            device = %self.device_uuid,
            address = format_args!("{:#06x}", node.unicast_address),
            "provisioned"
        );
        self.node = Some(node);

        self.transition(DeviceState::Complete)?;
        Ok(vec![Pdu::Complete.to_bytes()])
    }

    fn session_mut(&mut self) -> ProvisioningResult<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| ProvisioningError::InvalidTransition("session discarded".into()))
    }

    fn fail(&mut self, error: &ProvisioningError) {
        tracing::warn!(
            device = %self.device_uuid,
            state = ?self.state,
            code = %error.failure_code(),
            "provisioning failed: {}",
            error
        );
        if !self.state.is_terminal() {
            self.state = DeviceState::Failed;
        }
        self.session = None;
    }

    /// Transition to new state.
    fn transition(&mut self, new_state: DeviceState) -> ProvisioningResult<()> {
        if !self.state.can_transition_to(new_state) {
            return Err(ProvisioningError::InvalidTransition(format!(
                "{:?} -> {:?}",
                self.state, new_state
            )));
        }
        tracing::debug!("Device state: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        if new_state.is_terminal() {
            self.session = None;
        }
        Ok(())
    }
}
