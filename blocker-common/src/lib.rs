// ABOUTME: defines the component identity types and the privileged service protocol shared by blocker and blockerd.
// ABOUTME: provides parsing and validation helpers so both ends reject malformed requests the same way.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "0.1";

/// Name the privileged service registers its socket under.
pub const SERVICE_NAME: &str = "blocker_pm";

const MAX_NAME_LEN: usize = 512;

/// Identifies one activity, service, receiver or provider of an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ComponentIdentity {
    pub package_name: String,
    pub component_name: String,
}

impl ComponentIdentity {
    pub fn new(package_name: impl Into<String>, component_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            component_name: component_name.into(),
        }
    }

    /// `{package}/{component}` with no escaping; component names containing `/` are not supported.
    pub fn flatten(&self) -> String {
        format!("{}/{}", self.package_name, self.component_name)
    }
}

impl std::fmt::Display for ComponentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.package_name, self.component_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Default,
    Enabled,
    Disabled,
}

impl ComponentState {
    /// The package manager's integer encoding of the state.
    pub fn as_pm_value(self) -> i32 {
        match self {
            ComponentState::Default => 0,
            ComponentState::Enabled => 1,
            ComponentState::Disabled => 2,
        }
    }

    pub fn from_pm_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(ComponentState::Default),
            1 => Some(ComponentState::Enabled),
            2 => Some(ComponentState::Disabled),
            _ => None,
        }
    }

    /// DEFAULT and ENABLED are operationally the same thing.
    pub fn is_enabled(self) -> bool {
        !matches!(self, ComponentState::Disabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ComponentCategory {
    Activity,
    #[serde(alias = "broadcast")]
    Receiver,
    Service,
    Provider,
}

impl ComponentCategory {
    /// Intent firewall rules cover activities, broadcasts and services only.
    pub fn supports_ifw(self) -> bool {
        !matches!(self, ComponentCategory::Provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServiceRequest {
    pub request_id: String,
    pub version: String,
    pub call: ServiceCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceCall {
    SwitchComponent(SwitchComponentCall),
    GetUid,
    GetPid,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SwitchComponentCall {
    pub package_name: String,
    pub component_name: String,
    pub state: ComponentState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServiceResponse {
    pub request_id: String,
    pub result: Option<CallResult>,
    pub error: Option<RequestError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallResult {
    SwitchComponent(SwitchComponentResult),
    Uid { uid: u32 },
    Pid { pid: u32 },
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SwitchComponentResult {
    pub ok: bool,
    pub status: SwitchStatus,
}

/// Outcome of a component switch as reported to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStatus {
    Success,
    PermissionDenied,
    ProcessTerminatedUnexpectedly,
    Timeout,
    ComponentNotFound,
    /// The backend has no way to express the requested state.
    UnsupportedState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseFailed,
    ValidationFailed,
    RequestTooLarge,
    PermissionDenied,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn parse_request(input: &str) -> Result<ServiceRequest, serde_json::Error> {
    serde_json::from_str(input)
}

pub fn validate_request(request: &ServiceRequest) -> Result<(), ValidationError> {
    if request.request_id.trim().is_empty() {
        return Err(ValidationError::new("request_id must be non-empty"));
    }
    if request.version != PROTOCOL_VERSION {
        return Err(ValidationError::new(format!(
            "unsupported version {:?}, expected {PROTOCOL_VERSION:?}",
            request.version
        )));
    }

    if let ServiceCall::SwitchComponent(call) = &request.call {
        validate_identity(&call.package_name, &call.component_name)?;
    }
    Ok(())
}

/// Rejects names that would corrupt a `{package}/{component}` filter or a shell command line.
pub fn validate_identity(package_name: &str, component_name: &str) -> Result<(), ValidationError> {
    validate_package_name(package_name)?;
    validate_name("component_name", component_name)?;

    if component_name.contains('/') {
        return Err(ValidationError::new("component_name must not contain '/'"));
    }
    if component_name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '`' | ';' | '&' | '|' | '<' | '>' | '\\'))
    {
        return Err(ValidationError::new(
            "component_name contains characters that are not valid in a class name",
        ));
    }
    Ok(())
}

/// Package names double as rule file names, so only `[A-Za-z0-9._]` is accepted.
pub fn validate_package_name(package_name: &str) -> Result<(), ValidationError> {
    validate_name("package_name", package_name)?;
    if !package_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
    {
        return Err(ValidationError::new(
            "package_name may only contain letters, digits, '.' and '_'",
        ));
    }
    if package_name.starts_with('.') {
        return Err(ValidationError::new("package_name must not start with '.'"));
    }
    Ok(())
}

fn validate_name(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(format!("{field} must be non-empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ValidationError::new(format!(
            "{field} exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}
