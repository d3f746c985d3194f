// ABOUTME: relays component switches to the privileged blockerd service over its unix socket.
// ABOUTME: sends one json request per connection and maps the reported status back onto control errors.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blocker_common::{
    validate_identity, CallResult, ComponentState, ErrorCode, ServiceCall, ServiceRequest, ServiceResponse,
    SwitchComponentCall, SwitchStatus, PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::error::ControlError;

pub struct ServiceController {
    socket_path: PathBuf,
    timeout: Duration,
    sequence: AtomicU64,
    bridge: Arc<Bridge>,
}

/// `<dir>/<name>.sock`
pub fn socket_path(service_dir: &Path, service_name: &str) -> PathBuf {
    service_dir.join(format!("{service_name}.sock"))
}

impl ServiceController {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration, bridge: Arc<Bridge>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
            sequence: AtomicU64::new(0),
            bridge,
        }
    }

    /// Resolves the service by name and confirms it answers before handing it out.
    pub fn locate(
        service_dir: &Path,
        service_name: &str,
        timeout: Duration,
        bridge: Arc<Bridge>,
    ) -> Result<Self, ControlError> {
        let path = socket_path(service_dir, service_name);
        if !path.exists() {
            return Err(ControlError::PrivilegeUnavailable(format!(
                "service {service_name} is not running ({} missing)",
                path.display()
            )));
        }

        let controller = Self::new(path, timeout, bridge);
        match controller.call(ServiceCall::Ping)? {
            CallResult::Pong => {
                debug!(socket = %controller.socket_path.display(), "privileged service located");
                Ok(controller)
            }
            other => Err(ControlError::Protocol(format!("unexpected ping answer: {other:?}"))),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn switch_component(
        &self,
        package_name: &str,
        component_name: &str,
        state: ComponentState,
    ) -> Result<bool, ControlError> {
        validate_identity(package_name, component_name)?;
        let call = ServiceCall::SwitchComponent(SwitchComponentCall {
            package_name: package_name.to_string(),
            component_name: component_name.to_string(),
            state,
        });
        let result = match self.call(call)? {
            CallResult::SwitchComponent(result) => result,
            other => {
                return Err(ControlError::Protocol(format!(
                    "unexpected switch answer: {other:?}"
                )))
            }
        };

        match result.status {
            SwitchStatus::Success => {
                info!(package_name, component_name, ?state, "switched component via service");
                Ok(true)
            }
            SwitchStatus::ComponentNotFound => Ok(false),
            SwitchStatus::PermissionDenied => Err(ControlError::PermissionDenied(format!(
                "service refused {package_name}/{component_name}"
            ))),
            SwitchStatus::Timeout => Err(ControlError::Timeout(self.timeout)),
            SwitchStatus::ProcessTerminatedUnexpectedly => {
                Err(ControlError::ProcessTerminatedUnexpectedly { status: None })
            }
            SwitchStatus::UnsupportedState => Err(ControlError::UnsupportedState(state)),
        }
    }

    pub fn service_uid(&self) -> Result<u32, ControlError> {
        match self.call(ServiceCall::GetUid)? {
            CallResult::Uid { uid } => Ok(uid),
            other => Err(ControlError::Protocol(format!("unexpected uid answer: {other:?}"))),
        }
    }

    pub fn service_pid(&self) -> Result<u32, ControlError> {
        match self.call(ServiceCall::GetPid)? {
            CallResult::Pid { pid } => Ok(pid),
            other => Err(ControlError::Protocol(format!("unexpected pid answer: {other:?}"))),
        }
    }

    fn call(&self, call: ServiceCall) -> Result<CallResult, ControlError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let request = ServiceRequest {
            request_id: format!("blocker-{}-{seq}", std::process::id()),
            version: PROTOCOL_VERSION.to_string(),
            call,
        };
        let payload = serde_json::to_vec(&request).map_err(|err| ControlError::Protocol(err.to_string()))?;

        let raw = self.bridge.block_on(async {
            tokio::time::timeout(self.timeout, exchange(&self.socket_path, &payload)).await
        });
        let raw = match raw {
            Ok(result) => result?,
            Err(_) => return Err(ControlError::Timeout(self.timeout)),
        };

        let response: ServiceResponse =
            serde_json::from_slice(&raw).map_err(|err| ControlError::Protocol(format!("bad response: {err}")))?;
        if response.request_id != request.request_id {
            return Err(ControlError::Protocol(format!(
                "response for {:?} does not match request {:?}",
                response.request_id, request.request_id
            )));
        }
        if let Some(error) = response.error {
            return Err(match error.code {
                ErrorCode::PermissionDenied => ControlError::PermissionDenied(error.message),
                ErrorCode::ValidationFailed => ControlError::InvalidComponent(error.message),
                _ => ControlError::Protocol(error.message),
            });
        }
        response
            .result
            .ok_or_else(|| ControlError::Protocol("response carried neither result nor error".to_string()))
    }
}

async fn exchange(socket_path: &Path, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(payload).await?;
    stream.shutdown().await?;

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}
