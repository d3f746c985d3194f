// ABOUTME: exposes one component-switch operation over package-manager, service, shell and rule backends.
// ABOUTME: picks the backend once from the privilege available to the process.

pub mod app;
pub mod combined;
pub mod direct;
pub mod ifw;
pub mod service;
pub mod shell;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use blocker_common::{validate_identity, ComponentIdentity, ComponentState};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::BlockerConfig;
use crate::error::{ControlError, PmError};
use crate::exec::RootShell;
use crate::ifw::IfwStore;
use crate::pm::PackageManager;

pub use app::AppController;
pub use combined::CombinedController;
pub use direct::DirectController;
pub use ifw::IfwController;
pub use service::ServiceController;
pub use shell::ShellController;

const ROOT_UID: u32 = 0;
const SYSTEM_UID: u32 = 1000;
const SHELL_UID: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Auto,
    Direct,
    Service,
    Shell,
    /// Intent firewall rules, with providers left to the detected package-manager backend.
    Ifw,
    /// Rules and the detected package-manager backend together.
    Combined,
}

pub enum ComponentController {
    Direct(DirectController),
    Service(ServiceController),
    Shell(ShellController),
    Ifw(IfwController),
    Combined(CombinedController),
}

impl ComponentController {
    pub fn backend(&self) -> Backend {
        match self {
            ComponentController::Direct(_) => Backend::Direct,
            ComponentController::Service(_) => Backend::Service,
            ComponentController::Shell(_) => Backend::Shell,
            ComponentController::Ifw(_) => Backend::Ifw,
            ComponentController::Combined(_) => Backend::Combined,
        }
    }

    /// `Ok(false)` means the backend could not apply the state (unknown component, remote failure).
    pub fn switch_component(
        &self,
        package_name: &str,
        component_name: &str,
        state: ComponentState,
    ) -> Result<bool, ControlError> {
        validate_identity(package_name, component_name)?;
        match self {
            ComponentController::Direct(c) => c.switch_component(package_name, component_name, state),
            ComponentController::Service(c) => c.switch_component(package_name, component_name, state),
            ComponentController::Shell(c) => c.switch_component(package_name, component_name, state),
            ComponentController::Ifw(c) => c.switch_component(package_name, component_name, state),
            ComponentController::Combined(c) => c.switch_component(package_name, component_name, state),
        }
    }

    /// Rule-based backends answer from their rules; the others ask the package manager.
    pub fn check_component_enable_state(
        &self,
        pm: &dyn PackageManager,
        component: &ComponentIdentity,
        user_id: u32,
    ) -> Result<bool, ControlError> {
        match self {
            ComponentController::Ifw(c) => c.check_component_enable_state(component),
            ComponentController::Combined(c) => c.check_component_enable_state(component),
            _ => Ok(check_component_enable_state(pm, component, user_id)?),
        }
    }

    pub fn enable(&self, package_name: &str, component_name: &str) -> Result<bool, ControlError> {
        self.switch_component(package_name, component_name, ComponentState::Enabled)
    }

    pub fn disable(&self, package_name: &str, component_name: &str) -> Result<bool, ControlError> {
        self.switch_component(package_name, component_name, ComponentState::Disabled)
    }

    /// Enables each component in turn; returns how many succeeded.
    pub fn batch_enable(
        &self,
        components: &[ComponentIdentity],
        on_each: impl FnMut(&ComponentIdentity, &Result<bool, ControlError>),
    ) -> usize {
        self.batch(components, ComponentState::Enabled, on_each)
    }

    pub fn batch_disable(
        &self,
        components: &[ComponentIdentity],
        on_each: impl FnMut(&ComponentIdentity, &Result<bool, ControlError>),
    ) -> usize {
        self.batch(components, ComponentState::Disabled, on_each)
    }

    fn batch(
        &self,
        components: &[ComponentIdentity],
        state: ComponentState,
        mut on_each: impl FnMut(&ComponentIdentity, &Result<bool, ControlError>),
    ) -> usize {
        let mut succeeded = 0;
        for component in components {
            let outcome = self.switch_component(&component.package_name, &component.component_name, state);
            if matches!(outcome, Ok(true)) {
                succeeded += 1;
            }
            on_each(component, &outcome);
        }
        debug!(total = components.len(), succeeded, ?state, "batch switch finished");
        succeeded
    }
}

/// DEFAULT and ENABLED both count as enabled.
pub fn check_component_enable_state(
    pm: &dyn PackageManager,
    component: &ComponentIdentity,
    user_id: u32,
) -> Result<bool, PmError> {
    Ok(pm.component_enabled_setting(component, user_id)?.is_enabled())
}

/// Everything backend selection may need to build a controller.
pub struct BackendDeps<'a> {
    pub config: &'a BlockerConfig,
    pub bridge: &'a Arc<Bridge>,
    pub shell: &'a Arc<RootShell>,
    pub pm: &'a Arc<dyn PackageManager>,
    /// Resolves the rule store; only the rule backends call it.
    pub ifw: &'a dyn Fn() -> Arc<IfwStore>,
}

pub fn select_backend(deps: &BackendDeps<'_>) -> Result<ComponentController, ControlError> {
    select_backend_for_uid(deps, unsafe { libc::geteuid() })
}

fn select_backend_for_uid(deps: &BackendDeps<'_>, euid: u32) -> Result<ComponentController, ControlError> {
    let config = deps.config;
    let controller = match config.backend {
        Backend::Auto => detect(deps, euid)?,
        Backend::Direct => direct(deps),
        Backend::Shell => shell(deps),
        Backend::Service => ComponentController::Service(ServiceController::new(
            service::socket_path(&config.service_dir, &config.service_name),
            config.command_timeout,
            Arc::clone(deps.bridge),
        )),
        Backend::Ifw => {
            let fallback = Arc::new(detect(deps, euid)?);
            ComponentController::Ifw(IfwController::new((deps.ifw)(), Arc::clone(deps.pm), fallback))
        }
        Backend::Combined => {
            let fallback = Arc::new(detect(deps, euid)?);
            let ifw = IfwController::new((deps.ifw)(), Arc::clone(deps.pm), Arc::clone(&fallback));
            ComponentController::Combined(CombinedController::new(
                ifw,
                fallback,
                Arc::clone(deps.pm),
                config.user_id,
            ))
        }
    };

    info!(backend = ?controller.backend(), euid, "component controller selected");
    Ok(controller)
}

fn direct(deps: &BackendDeps<'_>) -> ComponentController {
    ComponentController::Direct(DirectController::new(Arc::clone(deps.pm), deps.config.user_id))
}

fn shell(deps: &BackendDeps<'_>) -> ComponentController {
    ComponentController::Shell(ShellController::new(Arc::clone(deps.shell), deps.config.pm.pm.clone()))
}

/// Direct for privileged uids, then the service, then a root shell.
fn detect(deps: &BackendDeps<'_>, euid: u32) -> Result<ComponentController, ControlError> {
    let config = deps.config;
    if matches!(euid, ROOT_UID | SYSTEM_UID | SHELL_UID) {
        return Ok(direct(deps));
    }

    match ServiceController::locate(
        &config.service_dir,
        &config.service_name,
        config.command_timeout,
        Arc::clone(deps.bridge),
    ) {
        Ok(service) => Ok(ComponentController::Service(service)),
        Err(err) => {
            debug!(error = %err, "privileged service unavailable");
            if !deps.shell.is_available() {
                warn!(euid, "no privileged backend is available");
                return Err(ControlError::PrivilegeUnavailable(format!(
                    "uid {euid} has no package-manager permission, no {} service and no root shell",
                    config.service_name
                )));
            }
            Ok(shell(deps))
        }
    }
}
