// ABOUTME: switches components by calling the package manager with the process's own permission.
// ABOUTME: only valid for privileged callers; remote failures become a plain `false`.

use std::sync::Arc;

use blocker_common::{validate_identity, ComponentIdentity, ComponentState};
use tracing::{info, warn};

use crate::error::{ControlError, PmError};
use crate::pm::PackageManager;

pub struct DirectController {
    pm: Arc<dyn PackageManager>,
    user_id: u32,
}

impl DirectController {
    pub fn new(pm: Arc<dyn PackageManager>, user_id: u32) -> Self {
        Self { pm, user_id }
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn switch_component(
        &self,
        package_name: &str,
        component_name: &str,
        state: ComponentState,
    ) -> Result<bool, ControlError> {
        validate_identity(package_name, component_name)?;
        let component = ComponentIdentity::new(package_name, component_name);
        match self
            .pm
            .set_component_enabled_setting(&component, state, self.user_id)
        {
            Ok(()) => {
                info!(%component, ?state, user_id = self.user_id, "switched component");
                Ok(true)
            }
            Err(PmError::Remote(msg)) | Err(PmError::ComponentNotFound(msg)) => {
                warn!(%component, error = %msg, "package manager refused the switch");
                Ok(false)
            }
            Err(PmError::PermissionDenied(msg)) => Err(ControlError::PermissionDenied(msg)),
            Err(PmError::Exec(err)) => Err(err.into()),
        }
    }
}
