//! OOB capability registry for the simulated device.

use meshprov_core::oob::{self, AuthValue};
use meshprov_core::{
    AuthSelection, Capabilities, InputOobAction, OutputOobAction, ProvisioningError,
    ProvisioningResult,
};

/// Shows an output OOB value to the user (blink count, number, text).
pub type OutputHandler = Box<dyn Fn(OutputOobAction, &str) + Send + Sync>;

/// Asks the user for the value shown by the provisioner.
pub type InputHandler = Box<dyn Fn(InputOobAction, u8) -> ProvisioningResult<String> + Send + Sync>;

/// Advertised capabilities plus the means to act on each OOB method.
pub struct OobRegistry {
    capabilities: Capabilities,
    static_oob: Option<AuthValue>,
    output: Option<OutputHandler>,
    input: Option<InputHandler>,
}

impl OobRegistry {
    /// Registry advertising No OOB only.
    pub fn new(element_count: u8) -> Self {
        Self {
            capabilities: Capabilities::new(element_count),
            static_oob: None,
            output: None,
            input: None,
        }
    }

    /// Advertise static OOB with the given value.
    pub fn with_static_oob(mut self, value: AuthValue) -> Self {
        self.capabilities.static_oob = true;
        self.static_oob = Some(value);
        self
    }

    /// Advertise output OOB and register how values are shown.
    pub fn with_output<F>(
        mut self,
        size: u8,
        actions: impl IntoIterator<Item = OutputOobAction>,
        handler: F,
    ) -> Self
    where
        F: Fn(OutputOobAction, &str) + Send + Sync + 'static,
    {
        self.capabilities = self.capabilities.with_output_oob(size, actions);
        self.output = Some(Box::new(handler));
        self
    }

    /// Advertise input OOB and register how values are read.
    pub fn with_input<F>(
        mut self,
        size: u8,
        actions: impl IntoIterator<Item = InputOobAction>,
        handler: F,
    ) -> Self
    where
        F: Fn(InputOobAction, u8) -> ProvisioningResult<String> + Send + Sync + 'static,
    {
        self.capabilities = self.capabilities.with_input_oob(size, actions);
        self.input = Some(Box::new(handler));
        self
    }

    /// Capabilities to advertise.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// AuthValue fixed at Start, or `None` when it comes later from input.
    pub fn auth_value_at_start(&self, selection: &AuthSelection) -> ProvisioningResult<Option<AuthValue>> {
        self.capabilities.validate_selection(selection)?;
        match *selection {
            AuthSelection::NoOob => Ok(Some(oob::NO_OOB_AUTH_VALUE)),
            AuthSelection::StaticOob => self
                .static_oob
                .map(Some)
                .ok_or(ProvisioningError::UnsupportedMethod("static OOB".into())),
            AuthSelection::OutputOob { action, size } => {
                let value = oob::generate_output_value(action, size);
                match &self.output {
                    Some(show) => show(action, &value),
                    None => tracing::info!(?action, %value, "output OOB value"),
                }
                oob::auth_value_for(action.value_kind(), size, &value).map(Some)
            }
            AuthSelection::InputOob { .. } => Ok(None),
        }
    }

    /// Read the input OOB value from the user.
    pub fn read_input(&self, action: InputOobAction, size: u8) -> ProvisioningResult<String> {
        let read = self
            .input
            .as_ref()
            .ok_or_else(|| ProvisioningError::UnsupportedMethod("input OOB".into()))?;
        read(action, size)
    }
}

impl std::fmt::Debug for OobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobRegistry")
            .field("capabilities", &self.capabilities)
            .field("static_oob", &self.static_oob.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn builders_set_advertised_capabilities() {
        let registry = OobRegistry::new(2)
            .with_static_oob([1; 16])
            .with_output(4, [OutputOobAction::Blink], |_, _| {})
            .with_input(6, [InputOobAction::InputAlphanumeric], |_, _| Ok("A".into()));
        let caps = registry.capabilities();
        assert_eq!(caps.element_count, 2);
        assert!(caps.static_oob);
        assert_eq!(caps.output_oob_size, 4);
        assert_eq!(caps.input_oob_size, 6);
        assert_eq!(caps.auth_methods().len(), 4);
    }

    #[test]
    fn output_value_is_shown_and_encoded() {
        let shown = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&shown);
        let registry = OobRegistry::new(1).with_output(
            4,
            [OutputOobAction::OutputNumeric],
            move |_, value| *slot.lock().unwrap() = Some(value.to_string()),
        );

        let selection = AuthSelection::OutputOob {
            action: OutputOobAction::OutputNumeric,
            size: 4,
        };
        let auth = registry.auth_value_at_start(&selection).unwrap().unwrap();
        let value = shown.lock().unwrap().clone().unwrap();
        let number: u32 = value.parse().unwrap();
        assert_eq!(auth, oob::numeric_auth_value(number));
    }

    #[test]
    fn unadvertised_method_rejected() {
        let registry = OobRegistry::new(1);
        assert!(matches!(
            registry.auth_value_at_start(&AuthSelection::StaticOob),
            Err(ProvisioningError::UnsupportedMethod(_))
        ));
        assert!(registry.read_input(InputOobAction::Push, 1).is_err());
    }

    #[test]
    fn static_and_no_oob_values() {
        let registry = OobRegistry::new(1).with_static_oob([7; 16]);
        assert_eq!(
            registry.auth_value_at_start(&AuthSelection::StaticOob).unwrap(),
            Some([7; 16])
        );
        assert_eq!(
            registry.auth_value_at_start(&AuthSelection::NoOob).unwrap(),
            Some([0; 16])
        );
    }
}
