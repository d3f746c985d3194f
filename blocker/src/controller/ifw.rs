// ABOUTME: switches components by adding or removing intent firewall rules for them.
// ABOUTME: hands providers to a package-manager backend because ifw rules cannot cover them.

use std::sync::Arc;

use blocker_common::{validate_identity, ComponentCategory, ComponentIdentity, ComponentState};
use tracing::{debug, info, warn};

use crate::controller::ComponentController;
use crate::error::ControlError;
use crate::ifw::IfwStore;
use crate::pm::PackageManager;

pub struct IfwController {
    store: Arc<IfwStore>,
    pm: Arc<dyn PackageManager>,
    fallback: Arc<ComponentController>,
}

impl IfwController {
    /// `fallback` switches what rules cannot cover; it must not itself be rule based.
    pub fn new(store: Arc<IfwStore>, pm: Arc<dyn PackageManager>, fallback: Arc<ComponentController>) -> Self {
        Self { store, pm, fallback }
    }

    /// DISABLED adds a filter and ENABLED removes it, saving when the document
    /// changed. A component already in the requested state counts as switched.
    /// Components the package does not declare yield `Ok(false)`.
    pub fn switch_component(
        &self,
        package_name: &str,
        component_name: &str,
        state: ComponentState,
    ) -> Result<bool, ControlError> {
        validate_identity(package_name, component_name)?;
        let component = ComponentIdentity::new(package_name, component_name);

        let Some(category) = self.pm.component_category(&component)? else {
            warn!(%component, "package does not declare the component");
            return Ok(false);
        };
        if !category.supports_ifw() {
            debug!(%component, fallback = ?self.fallback.backend(), "provider goes through the package manager");
            return self
                .fallback
                .switch_component(package_name, component_name, state);
        }

        self.apply(&component, category, state)?;
        Ok(true)
    }

    fn apply(
        &self,
        component: &ComponentIdentity,
        category: ComponentCategory,
        state: ComponentState,
    ) -> Result<(), ControlError> {
        let block = match state {
            ComponentState::Disabled => true,
            ComponentState::Enabled => false,
            ComponentState::Default => return Err(ControlError::UnsupportedState(state)),
        };

        let changed = self.store.with_rules(&component.package_name, |file| {
            let changed = if block {
                file.add_component(&component.component_name, category)?
            } else {
                file.remove_component(&component.component_name, category)?
            };
            if changed {
                file.save()?;
            }
            Ok(changed)
        })?;
        info!(%component, ?state, changed, "switched component via ifw");
        Ok(())
    }

    /// True unless a rule blocks the component.
    pub fn check_component_enable_state(&self, component: &ComponentIdentity) -> Result<bool, ControlError> {
        Ok(self
            .store
            .get_component_enable_state(&component.package_name, &component.component_name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{rule_store, FakePm};
    use crate::controller::DirectController;
    use crate::error::switch_status;
    use blocker_common::SwitchStatus;

    fn controller(store: &Arc<IfwStore>, pm: &Arc<FakePm>) -> IfwController {
        let fallback = ComponentController::Direct(DirectController::new(pm.clone(), 0));
        IfwController::new(Arc::clone(store), pm.clone(), Arc::new(fallback))
    }

    #[test]
    fn disabling_writes_a_rule_and_enabling_removes_it() {
        let fx = rule_store();
        let pm = Arc::new(FakePm::default());
        let ctl = controller(&fx.store, &pm);
        let path = fx.ifw.join("com.example.app.xml");
        let main = ComponentIdentity::new("com.example.app", "MainActivity");

        assert!(ctl
            .switch_component("com.example.app", "MainActivity", ComponentState::Disabled)
            .unwrap());
        assert!(ctl
            .switch_component("com.example.app", "MainActivity", ComponentState::Disabled)
            .unwrap());
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<activity"));
        assert_eq!(xml.matches("com.example.app/MainActivity").count(), 1);
        assert!(!ctl.check_component_enable_state(&main).unwrap());

        assert!(ctl
            .switch_component("com.example.app", "MainActivity", ComponentState::Enabled)
            .unwrap());
        assert!(!path.exists());
        assert!(ctl.check_component_enable_state(&main).unwrap());
        assert!(pm.switched().is_empty());
    }

    #[test]
    fn receivers_land_in_the_broadcast_section() {
        let fx = rule_store();
        let pm = Arc::new(FakePm::default());
        let ctl = controller(&fx.store, &pm);

        assert!(ctl
            .switch_component("com.example.app", "BootReceiver", ComponentState::Disabled)
            .unwrap());
        let xml = std::fs::read_to_string(fx.ifw.join("com.example.app.xml")).unwrap();
        assert!(xml.contains("<broadcast"));
        assert!(!xml.contains("<activity"));
    }

    #[test]
    fn providers_go_through_the_package_manager() {
        let fx = rule_store();
        let pm = Arc::new(FakePm::default());
        let ctl = controller(&fx.store, &pm);

        assert!(ctl
            .switch_component("com.example.app", "FilesProvider", ComponentState::Disabled)
            .unwrap());
        assert_eq!(
            pm.switched(),
            vec![("com.example.app/FilesProvider".to_string(), ComponentState::Disabled)]
        );
        assert!(!fx.ifw.join("com.example.app.xml").exists());
    }

    #[test]
    fn undeclared_components_are_not_found() {
        let fx = rule_store();
        let pm = Arc::new(FakePm::default());
        let ctl = controller(&fx.store, &pm);

        let outcome = ctl.switch_component("com.example.app", "Ghost", ComponentState::Disabled);
        assert!(matches!(outcome, Ok(false)));
        assert_eq!(switch_status(&outcome), SwitchStatus::ComponentNotFound);
        assert!(!fx.ifw.join("com.example.app.xml").exists());
    }

    #[test]
    fn default_state_has_no_rule_form() {
        let fx = rule_store();
        let pm = Arc::new(FakePm::default());
        let ctl = controller(&fx.store, &pm);

        let err = ctl
            .switch_component("com.example.app", "MainActivity", ComponentState::Default)
            .unwrap_err();
        assert!(matches!(err, ControlError::UnsupportedState(ComponentState::Default)));
    }

    #[test]
    fn invalid_names_are_rejected_before_any_lookup() {
        let fx = rule_store();
        let pm = Arc::new(FakePm::default());
        let ctl = controller(&fx.store, &pm);

        let err = ctl
            .switch_component("com.example.app", "x/MainActivity", ComponentState::Disabled)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidComponent(_)));
    }
}
