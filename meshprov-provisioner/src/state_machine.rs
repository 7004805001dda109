//! Provisioner state machine.
//!
//! Sans-IO: outbound steps return PDU bytes to send, inbound steps take the
//! bytes received. Any error moves the machine to `Failed` and discards the
//! session.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use meshprov_core::{
    AuthSelection, Capabilities, ConfirmationInputs, FailureCode, KeyPair, PduType, ProvisionedNode,
    ProvisioningData, ProvisioningError, ProvisioningObserver, ProvisioningResult,
    ProvisioningState, Session, StateChange,
};

use crate::phases;

/// Provisioner state machine driving one attempt.
pub struct ProvisionerStateMachine {
    state: ProvisioningState,
    device_uuid: Uuid,
    session: Option<Session>,
    last_error: Option<FailureCode>,
    observer: Option<Arc<dyn ProvisioningObserver>>,
}

impl ProvisionerStateMachine {
    /// Create a state machine for one device. The payload is validated here so
    /// nothing is sent for data that could never be delivered.
    pub fn new(device_uuid: Uuid, data: ProvisioningData) -> ProvisioningResult<Self> {
        data.validate()?;
        Ok(Self {
            state: ProvisioningState::Idle,
            device_uuid,
            session: Some(Session::new(device_uuid, data)),
            last_error: None,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProvisioningObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Get current state.
    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }

    /// Failure code of the error that ended the attempt, if it failed.
    pub fn last_error(&self) -> Option<FailureCode> {
        self.last_error
    }

    /// Active session, `None` once the attempt ended.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Capabilities the device advertised.
    pub fn capabilities(&self) -> ProvisioningResult<&Capabilities> {
        self.active()?.capabilities()
    }

    /// Value the user must enter on the device, for input OOB.
    pub fn input_oob_value(&self) -> Option<&str> {
        self.session
            .as_ref()
            .and_then(|s| s.oob_value().ok())
            .map(String::as_str)
    }

    /// Whether the device will send Input Complete before confirmations.
    pub fn awaiting_input_complete(&self) -> bool {
        self.state == ProvisioningState::PublicKeyReceived
            && matches!(
                self.session.as_ref().and_then(|s| s.selection().ok()),
                Some(AuthSelection::InputOob { .. })
            )
    }

    /// Build the Invite PDU.
    pub fn invite(&mut self, attention_timer: u8) -> ProvisioningResult<Vec<u8>> {
        self.send(ProvisioningState::InviteSent, PduType::Invite, |session| {
            let pdu = phases::build_invite(attention_timer);
            session.set_invite_pdu(pdu.clone());
            Ok(pdu)
        })
    }

    /// Handle the Capabilities PDU.
    pub fn on_capabilities(&mut self, pdu: &[u8]) -> ProvisioningResult<Capabilities> {
        self.receive(ProvisioningState::CapabilitiesReceived, PduType::Capabilities, pdu, |session| {
            let caps = phases::parse_capabilities(pdu)?;
            session.data()?.validate_for_elements(caps.element_count)?;
            session.set_capabilities_pdu(pdu.to_vec());
            session.set_capabilities(caps.clone());
            Ok(caps)
        })
    }

    /// Build the Start PDU for a selection the device supports.
    pub fn start(&mut self, selection: AuthSelection) -> ProvisioningResult<Vec<u8>> {
        self.send(ProvisioningState::StartSent, PduType::Start, |session| {
            session.capabilities()?.validate_selection(&selection)?;
            if let Some((value, auth)) = phases::input_oob_value(&selection)? {
                session.set_oob_value(value);
                session.set_auth_value(auth);
            }
            let pdu = phases::build_start(selection);
            session.set_selection(selection);
            session.set_start_pdu(pdu.clone());
            Ok(pdu)
        })
    }

    /// Build the provisioner Public Key PDU from a fresh key pair.
    pub fn public_key(&mut self) -> ProvisioningResult<Vec<u8>> {
        self.send(ProvisioningState::PublicKeySent, PduType::PublicKey, |session| {
            let key_pair = KeyPair::generate();
            let pdu = phases::build_public_key(&key_pair);
            session.set_key_pair(key_pair);
            Ok(pdu)
        })
    }

    /// Handle the device Public Key PDU.
    pub fn on_public_key(&mut self, pdu: &[u8]) -> ProvisioningResult<()> {
        self.receive(ProvisioningState::PublicKeyReceived, PduType::PublicKey, pdu, |session| {
            let (peer, secret) = phases::parse_public_key(pdu, session.key_pair()?)?;
            session.set_peer_public_key(peer);
            session.set_shared_secret(secret);
            Ok(())
        })
    }

    /// Handle Input Complete (input OOB only).
    pub fn on_input_complete(&mut self, pdu: &[u8]) -> ProvisioningResult<()> {
        if !self.awaiting_input_complete() {
            return Err(self.fail(ProvisioningError::UnexpectedPdu {
                expected: self.state.expected_pdu().unwrap_or(PduType::Confirmation),
                received: PduType::InputComplete,
            }));
        }
        self.receive(
            ProvisioningState::InputCompleteReceived,
            PduType::InputComplete,
            pdu,
            |_| phases::parse_input_complete(pdu),
        )
    }

    /// Build the Confirmation PDU. `oob` is the static OOB (hex) or the value
    /// the device output; ignored for no OOB and input OOB.
    pub fn confirmation(&mut self, oob: Option<&str>) -> ProvisioningResult<Vec<u8>> {
        if self.awaiting_input_complete() {
            return Err(self.fail(ProvisioningError::InvalidTransition(
                "confirmation before input complete".into(),
            )));
        }
        self.send(ProvisioningState::ConfirmationSent, PduType::Confirmation, |session| {
            let selection = *session.selection()?;
            if !matches!(selection, AuthSelection::InputOob { .. }) {
                session.set_auth_value(phases::auth_value(&selection, oob)?);
            }

            let inputs = ConfirmationInputs::new(
                session.invite_pdu()?,
                session.capabilities_pdu()?,
                session.start_pdu()?,
                session.key_pair()?.public_xy(),
                session.peer_public_key()?,
            )?;
            let random = phases::fresh_random();
            let (salt, pdu) = phases::build_confirmation(
                &inputs,
                session.shared_secret()?,
                &random,
                session.auth_value()?,
            );
            session.set_local_random(random);
            session.set_confirmation_salt(salt);
            Ok(pdu)
        })
    }

    /// Handle the device Confirmation PDU.
    pub fn on_confirmation(&mut self, pdu: &[u8]) -> ProvisioningResult<()> {
        self.receive(ProvisioningState::ConfirmationReceived, PduType::Confirmation, pdu, |session| {
            let confirmation = phases::parse_confirmation(pdu)?;
            session.set_peer_confirmation(confirmation);
            Ok(())
        })
    }

    /// Build the Random PDU revealing the provisioner random.
    pub fn random(&mut self) -> ProvisioningResult<Vec<u8>> {
        self.send(ProvisioningState::RandomSent, PduType::Random, |session| {
            Ok(phases::build_random(session.local_random()?))
        })
    }

    /// Handle the device Random PDU and verify the device confirmation.
    pub fn on_random(&mut self, pdu: &[u8]) -> ProvisioningResult<()> {
        self.receive(ProvisioningState::RandomReceived, PduType::Random, pdu, |session| {
            let (device_random, verified) = phases::verify_random(
                pdu,
                session.confirmation_salt()?,
                session.shared_secret()?,
                session.auth_value()?,
                session.peer_confirmation()?,
            )?;
            if !verified {
                return Err(ProvisioningError::ConfirmationFailed);
            }
            session.set_peer_random(device_random);
            Ok(())
        })
    }

    /// Build the encrypted Data PDU.
    pub fn data(&mut self) -> ProvisioningResult<Vec<u8>> {
        self.send(ProvisioningState::DataSent, PduType::Data, |session| {
            let (pdu, device_key) = phases::build_data(
                session.confirmation_salt()?,
                session.shared_secret()?,
                session.local_random()?,
                session.peer_random()?,
                session.data()?,
            )?;
            session.set_device_key(device_key);
            Ok(pdu)
        })
    }

    /// Handle Complete and return the provisioned node.
    pub fn on_complete(&mut self, pdu: &[u8]) -> ProvisioningResult<ProvisionedNode> {
        self.receive(ProvisioningState::Complete, PduType::Complete, pdu, |session| {
            phases::parse_complete(pdu)?;
            session.mark_provisioned(Utc::now());
            session.provisioned_node()
        })
    }

    /// Abandon the attempt. The session is discarded.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!(device = %self.device_uuid, "provisioning aborted");
            self.transition(ProvisioningState::Failed, None, None);
        }
    }

    fn active(&self) -> ProvisioningResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ProvisioningError::InvalidTransition(format!("no session in {:?}", self.state)))
    }

    /// Outbound step: the PDU the phase builds is what the observer sees.
    fn send(
        &mut self,
        target: ProvisioningState,
        pdu: PduType,
        phase: impl FnOnce(&mut Session) -> ProvisioningResult<Vec<u8>>,
    ) -> ProvisioningResult<Vec<u8>> {
        self.step(target, pdu, phase, |built| built.clone())
    }

    /// Inbound step for the received `bytes`.
    fn receive<T>(
        &mut self,
        target: ProvisioningState,
        pdu: PduType,
        bytes: &[u8],
        phase: impl FnOnce(&mut Session) -> ProvisioningResult<T>,
    ) -> ProvisioningResult<T> {
        self.step(target, pdu, phase, |_| bytes.to_vec())
    }

    /// Run one step: check the transition, run the phase against the session,
    /// then move to `target` or to `Failed`.
    fn step<T>(
        &mut self,
        target: ProvisioningState,
        pdu: PduType,
        phase: impl FnOnce(&mut Session) -> ProvisioningResult<T>,
        pdu_bytes: impl FnOnce(&T) -> Vec<u8>,
    ) -> ProvisioningResult<T> {
        if !self.state.can_transition_to(target) {
            let error = match self.state.expected_pdu() {
                Some(expected) if expected != pdu => ProvisioningError::UnexpectedPdu {
                    expected,
                    received: pdu,
                },
                _ => ProvisioningError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    self.state, target
                )),
            };
            return Err(self.fail(error));
        }

        let result = match self.session.as_mut() {
            Some(session) => phase(session),
            None => Err(ProvisioningError::InvalidTransition("session discarded".into())),
        };

        match result {
            Ok(value) => {
                let bytes = self.observer.is_some().then(|| pdu_bytes(&value));
                self.transition(target, Some(pdu), bytes);
                Ok(value)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Enter `Failed`, keep the failure code and drop the session.
    fn fail(&mut self, error: ProvisioningError) -> ProvisioningError {
        tracing::warn!(device = %self.device_uuid, state = ?self.state, "provisioning failed: {}", error);
        if !self.state.is_terminal() {
            self.last_error = Some(error.failure_code());
            self.transition(ProvisioningState::Failed, None, None);
        }
        error
    }

    /// Transition to new state.
    fn transition(
        &mut self,
        new_state: ProvisioningState,
        pdu: Option<PduType>,
        pdu_bytes: Option<Vec<u8>>,
    ) {
        tracing::debug!("Provisioner state: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        if new_state.is_terminal() {
            self.session = None;
        }
        if let Some(observer) = &self.observer {
            observer.on_state_changed(&StateChange {
                device_uuid: self.device_uuid,
                state: new_state,
                pdu,
                pdu_bytes,
            });
        }
    }
}

impl std::fmt::Debug for ProvisionerStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerStateMachine")
            .field("state", &self.state)
            .field("device_uuid", &self.device_uuid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use meshprov_core::crypto::{self, KeyPair};
    use meshprov_core::keys::{self, SessionKeys};
    use meshprov_core::{InputOobAction, Pdu};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<StateChange>>);

    impl ProvisioningObserver for Recorder {
        fn on_state_changed(&self, change: &StateChange) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    fn sample_data() -> ProvisioningData {
        ProvisioningData::new([0x7D; 16], 0, 0x0010)
    }

    fn machine() -> ProvisionerStateMachine {
        ProvisionerStateMachine::new(Uuid::new_v4(), sample_data()).unwrap()
    }

    /// Minimal device side computed directly from the key schedule.
    struct Peer {
        key_pair: KeyPair,
        random: [u8; 16],
        auth: [u8; 16],
        secret: Option<[u8; 32]>,
        salt: Option<[u8; 16]>,
    }

    impl Peer {
        fn new(auth: [u8; 16]) -> Self {
            Self {
                key_pair: KeyPair::generate(),
                random: crypto::random_bytes(),
                auth,
                secret: None,
                salt: None,
            }
        }

        fn public_key(&mut self, provisioner_pdu: &[u8]) -> Vec<u8> {
            let mut xy = [0u8; 64];
            xy.copy_from_slice(&provisioner_pdu[2..]);
            self.secret = Some(self.key_pair.agree(&xy).unwrap());
            Pdu::PublicKey(*self.key_pair.public_xy()).to_bytes()
        }

        fn confirmation(&mut self, sm: &ProvisionerStateMachine, provisioner_pk: &[u8]) -> Vec<u8> {
            let session = sm.session().unwrap();
            let mut xy = [0u8; 64];
            xy.copy_from_slice(&provisioner_pk[2..]);
            let inputs = ConfirmationInputs::new(
                session.invite_pdu().unwrap(),
                session.capabilities_pdu().unwrap(),
                session.start_pdu().unwrap(),
                &xy,
                self.key_pair.public_xy(),
            )
            .unwrap();
            let salt = inputs.salt();
            self.salt = Some(salt);
            let key = keys::confirmation_key(&self.secret.unwrap(), &salt);
            Pdu::Confirmation(keys::confirmation_value(&key, &self.random, &self.auth)).to_bytes()
        }
    }

    fn run_to_public_keys(sm: &mut ProvisionerStateMachine, peer: &mut Peer, selection: AuthSelection, caps: Capabilities) -> Vec<u8> {
        sm.invite(5).unwrap();
        sm.on_capabilities(&caps.to_pdu()).unwrap();
        sm.start(selection).unwrap();
        let pk = sm.public_key().unwrap();
        let device_pk = peer.public_key(&pk);
        sm.on_public_key(&device_pk).unwrap();
        pk
    }

    #[test]
    fn no_oob_flow_reaches_complete() {
        let recorder = Arc::new(Recorder::default());
        let mut sm = machine().with_observer(recorder.clone());
        let mut peer = Peer::new([0u8; 16]);
        let mut exchanged = Vec::new();

        let invite = sm.invite(5).unwrap();
        exchanged.push(invite);
        let caps = Capabilities::new(2).to_pdu();
        sm.on_capabilities(&caps).unwrap();
        exchanged.push(caps);
        exchanged.push(sm.start(AuthSelection::NoOob).unwrap());
        let pk = sm.public_key().unwrap();
        let device_pk = peer.public_key(&pk);
        exchanged.push(pk.clone());
        sm.on_public_key(&device_pk).unwrap();
        exchanged.push(device_pk);

        let confirmation = sm.confirmation(None).unwrap();
        assert_eq!(confirmation.len(), 18);
        exchanged.push(confirmation);
        let device_confirmation = peer.confirmation(&sm, &pk);
        sm.on_confirmation(&device_confirmation).unwrap();
        exchanged.push(device_confirmation);

        let random_pdu = sm.random().unwrap();
        exchanged.push(random_pdu.clone());
        let device_random = Pdu::Random(peer.random).to_bytes();
        sm.on_random(&device_random).unwrap();
        exchanged.push(device_random);
        assert_eq!(sm.state(), ProvisioningState::RandomReceived);

        let data_pdu = sm.data().unwrap();
        assert_eq!(data_pdu.len(), 35);
        exchanged.push(data_pdu.clone());

        // The device can decrypt what was sent.
        let mut provisioner_random = [0u8; 16];
        provisioner_random.copy_from_slice(&random_pdu[2..]);
        let salt = keys::provisioning_salt(&peer.salt.unwrap(), &provisioner_random, &peer.random);
        let session_keys = SessionKeys::derive(&peer.secret.unwrap(), &salt);
        let mut sealed = [0u8; 33];
        sealed.copy_from_slice(&data_pdu[2..]);
        assert_eq!(session_keys.open(&sealed).unwrap(), sample_data().to_bytes());

        let complete = Pdu::Complete.to_bytes();
        let node = sm.on_complete(&complete).unwrap();
        exchanged.push(complete);
        assert_eq!(sm.state(), ProvisioningState::Complete);
        assert!(sm.session().is_none());
        assert!(sm.last_error().is_none());
        assert_eq!(node.element_count, 2);
        assert_eq!(node.device_key, session_keys.device_key);

        let changes = recorder.0.lock().unwrap();
        assert_eq!(changes.len(), 11);
        assert_eq!(changes.first().map(|c| c.state), Some(ProvisioningState::InviteSent));
        assert_eq!(changes.last().map(|c| c.state), Some(ProvisioningState::Complete));
        let observed: Vec<_> = changes.iter().map(|c| c.pdu_bytes.clone().unwrap()).collect();
        assert_eq!(observed, exchanged);
        for change in changes.iter() {
            let bytes = change.pdu_bytes.as_deref().unwrap();
            assert_eq!(change.pdu, Some(meshprov_core::pdu::pdu_type(bytes).unwrap()));
        }
    }

    #[test]
    fn tampered_random_fails_confirmation() {
        let mut sm = machine();
        let mut peer = Peer::new([0u8; 16]);
        let pk = run_to_public_keys(&mut sm, &mut peer, AuthSelection::NoOob, Capabilities::new(1));
        sm.confirmation(None).unwrap();
        let device_confirmation = peer.confirmation(&sm, &pk);
        sm.on_confirmation(&device_confirmation).unwrap();
        sm.random().unwrap();

        let mut random = peer.random;
        random[0] ^= 0x01;
        assert!(matches!(
            sm.on_random(&Pdu::Random(random).to_bytes()),
            Err(ProvisioningError::ConfirmationFailed)
        ));
        assert_eq!(sm.state(), ProvisioningState::Failed);
        assert!(sm.session().is_none());
        assert_eq!(sm.last_error(), Some(FailureCode::ConfirmationFailed));

        // Later misuse does not overwrite the outcome.
        assert!(sm.data().is_err());
        assert_eq!(sm.last_error(), Some(FailureCode::ConfirmationFailed));
    }

    #[test]
    fn wrong_static_oob_fails_confirmation() {
        let mut sm = machine();
        let mut peer = Peer::new([0x11; 16]);
        let caps = Capabilities::new(1).with_static_oob();
        let pk = run_to_public_keys(&mut sm, &mut peer, AuthSelection::StaticOob, caps);
        sm.confirmation(Some(&"22".repeat(16))).unwrap();
        let device_confirmation = peer.confirmation(&sm, &pk);
        sm.on_confirmation(&device_confirmation).unwrap();
        sm.random().unwrap();
        assert!(matches!(
            sm.on_random(&Pdu::Random(peer.random).to_bytes()),
            Err(ProvisioningError::ConfirmationFailed)
        ));
    }

    #[test]
    fn failed_pdu_from_any_state_is_terminal() {
        let mut sm = machine();
        sm.invite(5).unwrap();
        let failed = Pdu::Failed(FailureCode::Unknown(0xFF)).to_bytes();
        assert!(matches!(
            sm.on_capabilities(&failed),
            Err(ProvisioningError::RemoteFailure(FailureCode::Unknown(0xFF)))
        ));
        assert_eq!(sm.state(), ProvisioningState::Failed);
        assert_eq!(sm.last_error(), Some(FailureCode::Unknown(0xFF)));
    }

    #[test]
    fn zero_element_capabilities_fail() {
        let mut sm = machine();
        sm.invite(5).unwrap();
        let mut caps = Capabilities::new(1).to_pdu();
        caps[2] = 0;
        assert!(matches!(sm.on_capabilities(&caps), Err(ProvisioningError::NoElements)));
        assert_eq!(sm.state(), ProvisioningState::Failed);
    }

    #[test]
    fn out_of_order_steps_are_rejected() {
        let mut sm = machine();
        assert!(sm.start(AuthSelection::NoOob).is_err());
        assert_eq!(sm.state(), ProvisioningState::Failed);

        let mut sm = machine();
        sm.invite(5).unwrap();
        assert!(matches!(
            sm.on_complete(&Pdu::Complete.to_bytes()),
            Err(ProvisioningError::UnexpectedPdu {
                expected: PduType::Capabilities,
                received: PduType::Complete,
            })
        ));
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let mut sm = machine();
        sm.invite(5).unwrap();
        sm.on_capabilities(&Capabilities::new(1).to_pdu()).unwrap();
        assert!(matches!(
            sm.start(AuthSelection::StaticOob),
            Err(ProvisioningError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn public_key_one_byte_short_fails() {
        let mut sm = machine();
        sm.invite(5).unwrap();
        sm.on_capabilities(&Capabilities::new(1).to_pdu()).unwrap();
        sm.start(AuthSelection::NoOob).unwrap();
        sm.public_key().unwrap();
        let mut short = Pdu::PublicKey(*KeyPair::generate().public_xy()).to_bytes();
        short.pop();
        assert!(matches!(
            sm.on_public_key(&short),
            Err(ProvisioningError::InvalidLength { expected: 66, actual: 65, .. })
        ));
    }

    #[test]
    fn input_oob_waits_for_input_complete() {
        let mut sm = machine();
        let mut peer = Peer::new([0u8; 16]);
        let caps = Capabilities::new(1).with_input_oob(4, [InputOobAction::InputNumeric]);
        let selection = AuthSelection::InputOob {
            action: InputOobAction::InputNumeric,
            size: 4,
        };
        run_to_public_keys(&mut sm, &mut peer, selection, caps);
        assert!(sm.input_oob_value().is_some());
        assert!(sm.awaiting_input_complete());

        sm.on_input_complete(&Pdu::InputComplete.to_bytes()).unwrap();
        assert_eq!(sm.state(), ProvisioningState::InputCompleteReceived);
        assert!(sm.confirmation(None).is_ok());
    }

    #[test]
    fn input_complete_without_input_oob_is_unexpected() {
        let mut sm = machine();
        let mut peer = Peer::new([0u8; 16]);
        run_to_public_keys(&mut sm, &mut peer, AuthSelection::NoOob, Capabilities::new(1));
        assert!(matches!(
            sm.on_input_complete(&Pdu::InputComplete.to_bytes()),
            Err(ProvisioningError::UnexpectedPdu { received: PduType::InputComplete, .. })
        ));
    }

    #[test]
    fn invalid_payload_rejected_up_front() {
        let data = ProvisioningData::new([1; 16], 0x1000, 1);
        assert!(ProvisionerStateMachine::new(Uuid::nil(), data).is_err());
    }

    #[test]
    fn abort_discards_session() {
        let mut sm = machine();
        sm.invite(5).unwrap();
        sm.abort();
        assert_eq!(sm.state(), ProvisioningState::Failed);
        assert!(sm.session().is_none());
        assert!(sm.last_error().is_none());
    }
}
