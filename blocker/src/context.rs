// ABOUTME: owns the runtime, root shell, rule store and selected controller for one process.
// ABOUTME: replaces process-wide singletons with state that lives exactly as long as this value.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use blocker_common::{ComponentIdentity, ComponentState};

use crate::bridge::Bridge;
use crate::config::BlockerConfig;
use crate::controller::{self, AppController, Backend, BackendDeps, ComponentController};
use crate::error::ControlError;
use crate::exec::RootShell;
use crate::ifw::IfwStore;
use crate::paths::StoragePaths;
use crate::pm::{CmdPackageManager, PackageManager};

pub struct Blocker {
    controller: Mutex<Option<Arc<ComponentController>>>,
    ifw: OnceLock<Arc<IfwStore>>,
    shell: Arc<RootShell>,
    pm: Arc<dyn PackageManager>,
    config: BlockerConfig,
    bridge: Arc<Bridge>,
}

impl Blocker {
    pub fn new(config: BlockerConfig) -> std::io::Result<Self> {
        let bridge = Arc::new(Bridge::new()?);
        let pm = Arc::new(CmdPackageManager::new(config.pm.clone(), Arc::clone(&bridge)));
        Ok(Self::assemble(config, bridge, pm))
    }

    pub fn with_package_manager(config: BlockerConfig, pm: Arc<dyn PackageManager>) -> std::io::Result<Self> {
        let bridge = Arc::new(Bridge::new()?);
        Ok(Self::assemble(config, bridge, pm))
    }

    fn assemble(config: BlockerConfig, bridge: Arc<Bridge>, pm: Arc<dyn PackageManager>) -> Self {
        let shell = Arc::new(RootShell::new(config.shell.clone(), Arc::clone(&bridge)));
        Self {
            controller: Mutex::new(None),
            ifw: OnceLock::new(),
            shell,
            pm,
            config,
            bridge,
        }
    }

    pub fn config(&self) -> &BlockerConfig {
        &self.config
    }

    pub fn shell(&self) -> &Arc<RootShell> {
        &self.shell
    }

    pub fn package_manager(&self) -> &Arc<dyn PackageManager> {
        &self.pm
    }

    /// Resolved on first use; the encrypted-filesystem check runs once.
    pub fn paths(&self) -> &StoragePaths {
        self.ifw().paths()
    }

    pub fn ifw(&self) -> &Arc<IfwStore> {
        self.ifw.get_or_init(|| {
            let paths = StoragePaths::from_system(&self.bridge, &self.config.getprop, self.config.command_timeout);
            Arc::new(IfwStore::new(
                paths,
                self.config.staging_dir.clone(),
                Arc::clone(&self.shell),
            ))
        })
    }

    /// Selects the backend on first use and keeps it for the life of this context.
    pub fn controller(&self) -> Result<Arc<ComponentController>, ControlError> {
        let mut slot = self.controller.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(controller) = slot.as_ref() {
            return Ok(Arc::clone(controller));
        }

        let ifw = || Arc::clone(self.ifw());
        let controller = Arc::new(controller::select_backend(&BackendDeps {
            config: &self.config,
            bridge: &self.bridge,
            shell: &self.shell,
            pm: &self.pm,
            ifw: &ifw,
        })?);
        *slot = Some(Arc::clone(&controller));
        Ok(controller)
    }

    pub fn switch_component(
        &self,
        package_name: &str,
        component_name: &str,
        state: ComponentState,
    ) -> Result<bool, ControlError> {
        self.controller()?
            .switch_component(package_name, component_name, state)
    }

    /// Application-level control for the configured user.
    pub fn apps(&self) -> AppController {
        AppController::new(Arc::clone(&self.pm), self.config.user_id)
    }

    /// With a rule backend configured the rules count too; otherwise only the package manager is asked.
    pub fn check_component_enable_state(&self, package_name: &str, component_name: &str) -> Result<bool, ControlError> {
        let component = ComponentIdentity::new(package_name, component_name);
        match self.config.backend {
            Backend::Ifw | Backend::Combined => {
                self.controller()?
                    .check_component_enable_state(self.pm.as_ref(), &component, self.config.user_id)
            }
            _ => Ok(controller::check_component_enable_state(
                self.pm.as_ref(),
                &component,
                self.config.user_id,
            )?),
        }
    }
}
