// ABOUTME: enables, disables and lists whole applications through the package-manager authority.
// ABOUTME: mirrors the component switch contract: refusals are `false`, missing permission is an error.

use std::sync::Arc;

use blocker_common::{validate_package_name, ComponentState};
use tracing::{info, warn};

use crate::error::{ControlError, PmError};
use crate::pm::PackageManager;

pub struct AppController {
    pm: Arc<dyn PackageManager>,
    user_id: u32,
}

impl AppController {
    pub fn new(pm: Arc<dyn PackageManager>, user_id: u32) -> Self {
        Self { pm, user_id }
    }

    pub fn installed_packages(&self) -> Result<Vec<String>, ControlError> {
        Ok(self.pm.installed_packages(self.user_id)?)
    }

    pub fn is_enabled(&self, package_name: &str) -> Result<bool, ControlError> {
        validate_package_name(package_name)?;
        Ok(self
            .pm
            .application_enabled_setting(package_name, self.user_id)?
            .is_enabled())
    }

    pub fn enable(&self, package_name: &str) -> Result<bool, ControlError> {
        self.switch_application(package_name, ComponentState::Enabled)
    }

    pub fn disable(&self, package_name: &str) -> Result<bool, ControlError> {
        self.switch_application(package_name, ComponentState::Disabled)
    }

    pub fn switch_application(&self, package_name: &str, state: ComponentState) -> Result<bool, ControlError> {
        validate_package_name(package_name)?;
        match self
            .pm
            .set_application_enabled_setting(package_name, state, self.user_id)
        {
            Ok(()) => {
                info!(package_name, ?state, user_id = self.user_id, "switched application");
                Ok(true)
            }
            Err(PmError::Remote(msg)) | Err(PmError::ComponentNotFound(msg)) => {
                warn!(package_name, error = %msg, "package manager refused the switch");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
