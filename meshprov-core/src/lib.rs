//! # meshprov-core
//!
//! Core library for Bluetooth Mesh provisioning.
//!
//! This crate provides the PDU codec, capability decoding, the crypto
//! facade and key schedule, the per-attempt session record, and the state
//! machine definitions shared by provisioners and devices, plus the
//! length-prefixed test bearer both roles speak.

pub mod bearer;
pub mod capabilities;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod oob;
pub mod pdu;
pub mod session;
pub mod state;

pub use bearer::{Bearer, BearerConfig, Transport, DEFAULT_MAX_PDU_SIZE};
pub use capabilities::{
    Algorithm, AuthMethod, AuthSelection, Capabilities, InputOobAction, OobValueKind,
    OutputOobAction,
};
pub use crypto::KeyPair;
pub use error::{FailureCode, ProvisioningError, ProvisioningResult};
pub use keys::{ConfirmationInputs, SessionKeys};
pub use oob::AuthValue;
pub use pdu::{Pdu, PduType, Start};
pub use session::{ProvisionedNode, ProvisioningData, Session};
pub use state::{DeviceState, ProvisioningObserver, ProvisioningState, StateChange, TracingObserver};

/// Mesh Profile version the PDU formats follow.
pub const MESH_PROFILE_VERSION: &str = "1.0.1";
