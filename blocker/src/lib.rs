// ABOUTME: controls the enabled state of android app components through pm, a privileged service, or ifw rules.
// ABOUTME: also builds the deterministic json reports the blocker cli prints.

pub mod bridge;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod exec;
pub mod ifw;
pub mod paths;
pub mod pm;

pub use config::BlockerConfig;
pub use context::Blocker;
pub use controller::{AppController, Backend, ComponentController};
pub use error::{switch_status, ControlError, ExecError, IfwError, PmError};

use blocker_common::{ComponentState, SwitchStatus};

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SwitchReport {
    pub package_name: String,
    pub component_name: String,
    pub state: ComponentState,
    pub backend: Option<Backend>,
    pub ok: bool,
    pub status: SwitchStatus,
    pub error: Option<String>,
}

pub fn switch_report(
    package_name: &str,
    component_name: &str,
    state: ComponentState,
    backend: Option<Backend>,
    outcome: &Result<bool, ControlError>,
) -> SwitchReport {
    SwitchReport {
        package_name: package_name.to_string(),
        component_name: component_name.to_string(),
        state,
        backend,
        ok: matches!(outcome, Ok(true)),
        status: switch_status(outcome),
        error: outcome.as_ref().err().map(|err| err.to_string()),
    }
}
