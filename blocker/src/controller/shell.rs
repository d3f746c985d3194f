// ABOUTME: switches components by running `pm enable|disable` through the root shell session.
// ABOUTME: infers "component not found" from exception text because the shell has no structured error channel.

use std::sync::Arc;

use blocker_common::{validate_identity, ComponentState};
use tracing::{info, warn};

use crate::error::ControlError;
use crate::exec::RootShell;
use crate::pm::{ILLEGAL_ARGUMENT_EXCEPTION, SECURITY_EXCEPTION};

pub struct ShellController {
    shell: Arc<RootShell>,
    pm_program: String,
}

impl ShellController {
    pub fn new(shell: Arc<RootShell>, pm_program: impl Into<String>) -> Self {
        Self {
            shell,
            pm_program: pm_program.into(),
        }
    }

    /// Runs `pm enable|disable {package}/.{component}`.
    ///
    /// `component_name` must be the class name relative to the package (the
    /// part after the `.` of the shorthand form). A fully qualified name is
    /// not rewritten and will usually make `pm` reject the component.
    /// DEFAULT has no shorthand and fails with `UnsupportedState`.
    pub fn switch_component(
        &self,
        package_name: &str,
        component_name: &str,
        state: ComponentState,
    ) -> Result<bool, ControlError> {
        // Both names end up on a root command line.
        validate_identity(package_name, component_name)?;
        let verb = match state {
            ComponentState::Enabled => "enable",
            ComponentState::Disabled => "disable",
            ComponentState::Default => return Err(ControlError::UnsupportedState(state)),
        };

        let command = pm_command(&self.pm_program, verb, package_name, component_name);
        let output = self.shell.run(&command)?;

        if output.contains(ILLEGAL_ARGUMENT_EXCEPTION) {
            warn!(package_name, component_name, output = %output, "pm rejected the component");
            return Ok(false);
        }
        if output.contains(SECURITY_EXCEPTION) {
            return Err(ControlError::PermissionDenied(output));
        }

        info!(package_name, component_name, ?state, "switched component via shell");
        Ok(true)
    }

    pub fn is_available(&self) -> bool {
        self.shell.is_available()
    }
}

fn pm_command(pm_program: &str, verb: &str, package_name: &str, component_name: &str) -> String {
    let target = format!("{package_name}/.{component_name}").replace('$', "\\$");
    format!("{pm_program} {verb} \"{target}\"")
}
