// ABOUTME: applies every switch both as an intent firewall rule and through the package manager.
// ABOUTME: a component reads as enabled when either layer still lets it run.

use std::sync::Arc;

use blocker_common::{ComponentIdentity, ComponentState};
use tracing::debug;

use crate::controller::{check_component_enable_state, ComponentController, IfwController};
use crate::error::ControlError;
use crate::pm::PackageManager;

pub struct CombinedController {
    ifw: IfwController,
    pm: Arc<ComponentController>,
    seam: Arc<dyn PackageManager>,
    user_id: u32,
}

impl CombinedController {
    pub fn new(
        ifw: IfwController,
        pm: Arc<ComponentController>,
        seam: Arc<dyn PackageManager>,
        user_id: u32,
    ) -> Self {
        Self {
            ifw,
            pm,
            seam,
            user_id,
        }
    }

    pub fn ifw(&self) -> &IfwController {
        &self.ifw
    }

    /// Both layers are always attempted in order; the switch holds only if both did.
    pub fn switch_component(
        &self,
        package_name: &str,
        component_name: &str,
        state: ComponentState,
    ) -> Result<bool, ControlError> {
        let by_rule = self.ifw.switch_component(package_name, component_name, state)?;
        let by_pm = self.pm.switch_component(package_name, component_name, state)?;
        debug!(package_name, component_name, by_rule, by_pm, "combined switch");
        Ok(by_rule && by_pm)
    }

    pub fn check_component_enable_state(&self, component: &ComponentIdentity) -> Result<bool, ControlError> {
        if self.ifw.check_component_enable_state(component)? {
            return Ok(true);
        }
        Ok(check_component_enable_state(self.seam.as_ref(), component, self.user_id)?)
    }
}
