//! Simulated unprovisioned Bluetooth Mesh device.
//!
//! The device answers a provisioner over the length-prefixed test bearer,
//! advertising the capabilities in its [`DeviceConfig`] and driving the
//! user side of OOB authentication through an [`OobRegistry`].

mod capability;
mod config;
mod handler;
mod state_machine;

pub use capability::{InputHandler, OobRegistry, OutputHandler};
pub use config::DeviceConfig;
pub use handler::{serve, serve_stream, DeviceServer};
pub use state_machine::{failure_pdu, ProvisioneeStateMachine};
