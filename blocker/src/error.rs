// ABOUTME: defines the error taxonomy for command execution, package-manager calls, rule files and controllers.
// ABOUTME: keeps privilege, process-death and timeout failures distinct so callers can surface them precisely.

use std::path::PathBuf;
use std::time::Duration;

use blocker_common::{ComponentCategory, ComponentState, SwitchStatus, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("root privilege unavailable: {0}")]
    PrivilegeUnavailable(String),

    #[error("shell session terminated unexpectedly (exit status {status:?})")]
    ProcessTerminatedUnexpectedly { status: Option<i32> },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("missing argv[0]")]
    EmptyCommand,

    #[error("spawn {program} failed: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PmError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("component not found: {0}")]
    ComponentNotFound(String),

    #[error("package manager call failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Debug, thiserror::Error)]
pub enum IfwError {
    #[error("{0:?} components cannot be blocked by intent firewall rules")]
    UnsupportedCategory(ComponentCategory),

    #[error("invalid package name: {0}")]
    InvalidPackage(String),

    #[error("refusing to touch {0} outside the ifw rule folder")]
    PathSafetyViolation(PathBuf),

    #[error("`{command}` exited with status {status}: {output}")]
    Command {
        command: String,
        status: i32,
        output: String,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize rules: {0}")]
    Serialize(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("privilege unavailable: {0}")]
    PrivilegeUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("execution channel terminated unexpectedly (exit status {status:?})")]
    ProcessTerminatedUnexpectedly { status: Option<i32> },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("invalid component: {0}")]
    InvalidComponent(String),

    #[error("{0:?} cannot be expressed by this backend")]
    UnsupportedState(ComponentState),

    #[error("package manager call failed: {0}")]
    Remote(String),

    #[error("rule file update failed: {0}")]
    Rules(String),

    #[error("privileged service protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for ControlError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::PrivilegeUnavailable(msg) => ControlError::PrivilegeUnavailable(msg),
            ExecError::ProcessTerminatedUnexpectedly { status } => {
                ControlError::ProcessTerminatedUnexpectedly { status }
            }
            ExecError::Timeout(after) => ControlError::Timeout(after),
            ExecError::EmptyCommand => ControlError::InvalidComponent(err.to_string()),
            ExecError::Spawn { .. } => ControlError::PrivilegeUnavailable(err.to_string()),
        }
    }
}

impl From<PmError> for ControlError {
    fn from(err: PmError) -> Self {
        match err {
            PmError::PermissionDenied(msg) => ControlError::PermissionDenied(msg),
            PmError::ComponentNotFound(msg) => ControlError::InvalidComponent(msg),
            PmError::Remote(msg) => ControlError::Remote(msg),
            PmError::Exec(err) => err.into(),
        }
    }
}

impl From<IfwError> for ControlError {
    fn from(err: IfwError) -> Self {
        match err {
            IfwError::Exec(err) => err.into(),
            IfwError::UnsupportedCategory(_) | IfwError::InvalidPackage(_) => {
                ControlError::InvalidComponent(err.to_string())
            }
            other => ControlError::Rules(other.to_string()),
        }
    }
}

impl From<ValidationError> for ControlError {
    fn from(err: ValidationError) -> Self {
        ControlError::InvalidComponent(err.message)
    }
}

/// Folds a switch outcome onto the status taxonomy reported to callers.
pub fn switch_status(outcome: &Result<bool, ControlError>) -> SwitchStatus {
    match outcome {
        Ok(true) => SwitchStatus::Success,
        Ok(false) => SwitchStatus::ComponentNotFound,
        Err(ControlError::PermissionDenied(_)) | Err(ControlError::PrivilegeUnavailable(_)) => {
            SwitchStatus::PermissionDenied
        }
        Err(ControlError::ProcessTerminatedUnexpectedly { .. })
        | Err(ControlError::Protocol(_))
        | Err(ControlError::Remote(_))
        | Err(ControlError::Rules(_))
        | Err(ControlError::Io(_)) => SwitchStatus::ProcessTerminatedUnexpectedly,
        Err(ControlError::Timeout(_)) => SwitchStatus::Timeout,
        Err(ControlError::InvalidComponent(_)) => SwitchStatus::ComponentNotFound,
        Err(ControlError::UnsupportedState(_)) => SwitchStatus::UnsupportedState,
    }
}
