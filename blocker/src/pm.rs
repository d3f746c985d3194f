// ABOUTME: models the os package-manager authority that owns component and application enabled settings.
// ABOUTME: ships an implementation that drives the pm and dumpsys tools with the caller's own privileges.

use std::sync::Arc;
use std::time::Duration;

use blocker_common::{ComponentCategory, ComponentIdentity, ComponentState};
use tracing::debug;

use crate::bridge::Bridge;
use crate::error::PmError;
use crate::exec::{run_argv, CommandOutput};

pub const SECURITY_EXCEPTION: &str = "java.lang.SecurityException";
pub const ILLEGAL_ARGUMENT_EXCEPTION: &str = "java.lang.IllegalArgumentException";
const UNKNOWN_COMPONENT: &str = "Unknown component";
const PACKAGE_PREFIX: &str = "package:";

/// Number of uids reserved per Android user.
pub const PER_USER_RANGE: u32 = 100_000;

pub fn user_id_for_uid(uid: u32) -> u32 {
    uid / PER_USER_RANGE
}

pub trait PackageManager: Send + Sync {
    fn installed_packages(&self, user_id: u32) -> Result<Vec<String>, PmError>;

    fn component_enabled_setting(
        &self,
        component: &ComponentIdentity,
        user_id: u32,
    ) -> Result<ComponentState, PmError>;

    fn set_component_enabled_setting(
        &self,
        component: &ComponentIdentity,
        state: ComponentState,
        user_id: u32,
    ) -> Result<(), PmError>;

    /// Which kind of component `component` is, or `None` when the package does not declare it.
    fn component_category(&self, component: &ComponentIdentity) -> Result<Option<ComponentCategory>, PmError>;

    fn application_enabled_setting(&self, package_name: &str, user_id: u32) -> Result<ComponentState, PmError>;

    fn set_application_enabled_setting(
        &self,
        package_name: &str,
        state: ComponentState,
        user_id: u32,
    ) -> Result<(), PmError>;
}

#[derive(Debug, Clone)]
pub struct PmTools {
    pub pm: String,
    pub dumpsys: String,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl Default for PmTools {
    fn default() -> Self {
        Self {
            pm: "pm".to_string(),
            dumpsys: "dumpsys".to_string(),
            env: vec![],
            timeout: Duration::from_secs(15),
        }
    }
}

/// Calls `pm`/`dumpsys` directly; only works when the process already holds the permission.
pub struct CmdPackageManager {
    tools: PmTools,
    bridge: Arc<Bridge>,
}

impl CmdPackageManager {
    pub fn new(tools: PmTools, bridge: Arc<Bridge>) -> Self {
        Self { tools, bridge }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, PmError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        debug!(?argv, "package manager call");
        Ok(self
            .bridge
            .block_on(run_argv(&argv, &self.tools.env, self.tools.timeout))?)
    }

    fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput, PmError> {
        let output = self.run(program, args)?;
        classify_output(&output)?;
        Ok(output)
    }
}

impl PackageManager for CmdPackageManager {
    fn installed_packages(&self, user_id: u32) -> Result<Vec<String>, PmError> {
        let user = user_id.to_string();
        let output = self.run_checked(&self.tools.pm, &["list", "packages", "--user", &user])?;
        Ok(parse_package_list(&output.stdout))
    }

    fn component_enabled_setting(
        &self,
        component: &ComponentIdentity,
        user_id: u32,
    ) -> Result<ComponentState, PmError> {
        let output = self.run_checked(&self.tools.dumpsys, &["package", &component.package_name])?;
        Ok(parse_component_setting(&output.stdout, component, user_id))
    }

    fn set_component_enabled_setting(
        &self,
        component: &ComponentIdentity,
        state: ComponentState,
        user_id: u32,
    ) -> Result<(), PmError> {
        let verb = match state {
            ComponentState::Enabled => "enable",
            ComponentState::Disabled => "disable",
            ComponentState::Default => "default-state",
        };
        let user = user_id.to_string();
        self.run_checked(&self.tools.pm, &[verb, "--user", &user, &component.flatten()])?;
        Ok(())
    }

    fn component_category(&self, component: &ComponentIdentity) -> Result<Option<ComponentCategory>, PmError> {
        let output = self.run_checked(&self.tools.dumpsys, &["package", &component.package_name])?;
        Ok(parse_component_category(&output.stdout, component))
    }

    fn application_enabled_setting(&self, package_name: &str, user_id: u32) -> Result<ComponentState, PmError> {
        let user = user_id.to_string();
        let output = self.run_checked(&self.tools.pm, &["list", "packages", "-d", "--user", &user])?;
        let disabled = parse_package_list(&output.stdout)
            .iter()
            .any(|p| p == package_name);
        Ok(if disabled {
            ComponentState::Disabled
        } else {
            ComponentState::Enabled
        })
    }

    fn set_application_enabled_setting(
        &self,
        package_name: &str,
        state: ComponentState,
        user_id: u32,
    ) -> Result<(), PmError> {
        let verb = match state {
            ComponentState::Enabled => "enable",
            ComponentState::Disabled => "disable-user",
            ComponentState::Default => "default-state",
        };
        let user = user_id.to_string();
        self.run_checked(&self.tools.pm, &[verb, "--user", &user, package_name])?;
        Ok(())
    }
}

/// Maps exception text printed by `pm` onto the package-manager error kinds.
pub fn classify_output(output: &CommandOutput) -> Result<(), PmError> {
    let text = output.combined();
    if text.contains(SECURITY_EXCEPTION) {
        return Err(PmError::PermissionDenied(first_line(&text)));
    }
    if text.contains(ILLEGAL_ARGUMENT_EXCEPTION) || text.contains(UNKNOWN_COMPONENT) {
        return Err(PmError::ComponentNotFound(first_line(&text)));
    }
    if !output.success() {
        return Err(PmError::Remote(format!(
            "exit status {:?}: {}",
            output.exit_code,
            first_line(&text)
        )));
    }
    Ok(())
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn parse_package_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(PACKAGE_PREFIX))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Reads the per-user `disabledComponents:`/`enabledComponents:` blocks of `dumpsys package`.
fn parse_component_setting(dump: &str, component: &ComponentIdentity, user_id: u32) -> ComponentState {
    let wanted = qualified_class_name(component);
    let user_header = format!("User {user_id}:");

    let mut in_user = false;
    let mut block: Option<(ComponentState, usize)> = None;
    for line in dump.lines() {
        let indent = line.len() - line.trim_start().len();
        let trimmed = line.trim();

        if trimmed.starts_with("User ") {
            in_user = trimmed.starts_with(&user_header);
            block = None;
            continue;
        }
        if !in_user {
            continue;
        }

        match trimmed {
            "disabledComponents:" => {
                block = Some((ComponentState::Disabled, indent));
                continue;
            }
            "enabledComponents:" => {
                block = Some((ComponentState::Enabled, indent));
                continue;
            }
            _ => {}
        }

        if let Some((state, header_indent)) = block {
            if indent <= header_indent {
                block = None;
            } else if trimmed == wanted {
                return state;
            }
        }
    }
    ComponentState::Default
}

/// Finds the component in the resolver tables and provider registry of `dumpsys package`.
///
/// Entries there use the `pkg/.Suffix` or `pkg/fully.qualified.Name` form.
fn parse_component_category(dump: &str, component: &ComponentIdentity) -> Option<ComponentCategory> {
    let wanted = qualified_class_name(component);
    let prefix = format!("{}/", component.package_name);

    let mut section = None;
    for line in dump.lines() {
        if !line.starts_with(char::is_whitespace) {
            section = match line.trim_end() {
                "Activity Resolver Table:" => Some(ComponentCategory::Activity),
                "Receiver Resolver Table:" => Some(ComponentCategory::Receiver),
                "Service Resolver Table:" => Some(ComponentCategory::Service),
                "Registered ContentProviders:" => Some(ComponentCategory::Provider),
                _ => None,
            };
            continue;
        }
        let Some(category) = section else {
            continue;
        };

        let found = line
            .split_whitespace()
            .map(|token| token.trim_end_matches([':', '}']))
            .filter_map(|token| token.strip_prefix(&prefix))
            .map(|class| ComponentIdentity::new(component.package_name.as_str(), class))
            .any(|entry| qualified_class_name(&entry) == wanted);
        if found {
            return Some(category);
        }
    }
    None
}

fn qualified_class_name(component: &ComponentIdentity) -> String {
    match component.component_name.strip_prefix('.') {
        Some(suffix) => format!("{}.{suffix}", component.package_name),
        None => component.component_name.clone(),
    }
}
