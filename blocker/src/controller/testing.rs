// ABOUTME: test doubles shared by the controller backends' tests.
// ABOUTME: fakes the package manager and builds rule stores over temporary directories.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blocker_common::{ComponentCategory, ComponentIdentity, ComponentState};

use crate::bridge::Bridge;
use crate::error::PmError;
use crate::exec::{RootShell, ShellConfig};
use crate::ifw::IfwStore;
use crate::paths::StoragePaths;
use crate::pm::PackageManager;

/// Records switches and answers according to the component name.
///
/// `Missing`, `Remote` and `Locked` fail the way the package manager would.
/// The category comes from the name's suffix (`...Activity`, `...Receiver`,
/// `...Service`, `...Provider`); anything else is undeclared. Applications
/// `com.example.gone` and `com.example.locked` fail the same way.
#[derive(Default)]
pub struct FakePm {
    pub calls: Mutex<Vec<(String, ComponentState, u32)>>,
    pub app_calls: Mutex<Vec<(String, ComponentState, u32)>>,
}

impl FakePm {
    pub fn switched(&self) -> Vec<(String, ComponentState)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, state, _)| (name.clone(), *state))
            .collect()
    }
}

impl PackageManager for FakePm {
    fn installed_packages(&self, _user_id: u32) -> Result<Vec<String>, PmError> {
        Ok(vec!["com.example.app".to_string()])
    }

    fn component_enabled_setting(
        &self,
        component: &ComponentIdentity,
        _user_id: u32,
    ) -> Result<ComponentState, PmError> {
        let name = component.flatten();
        Ok(self
            .calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(called, _, _)| *called == name)
            .map(|(_, state, _)| *state)
            .unwrap_or(ComponentState::Default))
    }

    fn set_component_enabled_setting(
        &self,
        component: &ComponentIdentity,
        state: ComponentState,
        user_id: u32,
    ) -> Result<(), PmError> {
        self.calls
            .lock()
            .unwrap()
            .push((component.flatten(), state, user_id));
        match component.component_name.as_str() {
            "Missing" => Err(PmError::ComponentNotFound("Unknown component".into())),
            "Remote" => Err(PmError::Remote("binder died".into())),
            "Locked" => Err(PmError::PermissionDenied("not allowed".into())),
            _ => Ok(()),
        }
    }

    fn component_category(&self, component: &ComponentIdentity) -> Result<Option<ComponentCategory>, PmError> {
        let name = component.component_name.as_str();
        Ok([
            ("Activity", ComponentCategory::Activity),
            ("Receiver", ComponentCategory::Receiver),
            ("Service", ComponentCategory::Service),
            ("Provider", ComponentCategory::Provider),
        ]
        .into_iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, category)| category))
    }

    fn application_enabled_setting(&self, package_name: &str, _user_id: u32) -> Result<ComponentState, PmError> {
        Ok(self
            .app_calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(called, _, _)| called == package_name)
            .map(|(_, state, _)| *state)
            .unwrap_or(ComponentState::Enabled))
    }

    fn set_application_enabled_setting(
        &self,
        package_name: &str,
        state: ComponentState,
        user_id: u32,
    ) -> Result<(), PmError> {
        match package_name {
            "com.example.gone" => Err(PmError::Remote("Unknown package: com.example.gone".into())),
            "com.example.locked" => Err(PmError::PermissionDenied("not allowed".into())),
            _ => {
                self.app_calls
                    .lock()
                    .unwrap()
                    .push((package_name.to_string(), state, user_id));
                Ok(())
            }
        }
    }
}

pub struct RuleFixture {
    _dir: tempfile::TempDir,
    pub store: Arc<IfwStore>,
    pub ifw: PathBuf,
}

/// A rule store whose "root" shell is a plain `sh` over a temp directory.
pub fn rule_store() -> RuleFixture {
    let dir = tempfile::tempdir().unwrap();
    let paths = StoragePaths::with_base(dir.path().join("data"));
    let ifw = paths.ifw_folder();
    std::fs::create_dir_all(&ifw).unwrap();

    let shell = Arc::new(RootShell::new(
        ShellConfig::unprivileged("sh", Duration::from_secs(5)),
        Arc::new(Bridge::new().unwrap()),
    ));
    let store = Arc::new(IfwStore::new(paths, dir.path().join("staging"), shell));
    RuleFixture {
        _dir: dir,
        store,
        ifw,
    }
}
