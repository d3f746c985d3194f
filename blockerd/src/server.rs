// ABOUTME: hosts the unix socket server that switches components on behalf of authorized callers.
// ABOUTME: enforces bounded reads, strict parsing, validation, peer-credential checks and audit logging.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use blocker::controller::DirectController;
use blocker::pm::{user_id_for_uid, PackageManager};
use blocker::{switch_status, ControlError};
use blocker_common::{
    parse_request, validate_request, CallResult, ErrorCode, RequestError, ServiceCall, ServiceResponse,
    SwitchComponentCall, SwitchComponentResult,
};
use std::os::unix::io::AsRawFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::audit;
use crate::policy::CallerPolicy;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const SOCKET_MODE: u32 = 0o666;
#[cfg(test)]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(50);
#[cfg(not(test))]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

pub struct ServiceState {
    pub policy: CallerPolicy,
    pub pm: Arc<dyn PackageManager>,
}

pub async fn run(socket_path: &Path, audit_path: &str, state: Arc<ServiceState>) -> anyhow::Result<()> {
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("remove existing socket at {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let listener =
        UnixListener::bind(socket_path).with_context(|| format!("bind {}", socket_path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .await
            .with_context(|| format!("chmod {}", socket_path.display()))?;
    }
    info!(
        socket = %socket_path.display(),
        allowed_uids = ?state.policy.allowed_uids(),
        "privileged service listening"
    );

    loop {
        let (stream, _addr) = listener.accept().await?;
        let audit_path = audit_path.to_string();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, &audit_path, &state).await {
                warn!(error = %err, "client handling failed");
            }
        });
    }
}

async fn handle_client(mut stream: UnixStream, audit_path: &str, state: &Arc<ServiceState>) -> anyhow::Result<()> {
    let peer = peer_credentials(&stream);

    let mut input = Vec::new();
    let mut buf = [0u8; 4096];
    let mut exceeded = false;
    let mut idle = false;
    loop {
        let n = match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                idle = true;
                break;
            }
        };
        if n == 0 {
            break;
        }
        if exceeded {
            continue;
        }
        if input.len() + n > MAX_REQUEST_BYTES {
            exceeded = true;
            continue;
        }
        input.extend_from_slice(&buf[..n]);
    }

    if exceeded {
        let _ = write_response(
            &mut stream,
            &error_response("unknown", ErrorCode::RequestTooLarge, "request exceeds max bytes"),
        )
        .await;
        return Ok(());
    }

    if idle && input.is_empty() {
        let _ = write_response(
            &mut stream,
            &error_response("unknown", ErrorCode::ParseFailed, "read timed out"),
        )
        .await;
        return Ok(());
    }

    let input_str = String::from_utf8_lossy(&input);
    let request = match parse_request(&input_str) {
        Ok(r) => r,
        Err(err) => {
            let _ = write_response(
                &mut stream,
                &error_response("unknown", ErrorCode::ParseFailed, &format!("parse failed: {err}")),
            )
            .await;
            return Ok(());
        }
    };

    let response = if let Err(err) = validate_request(&request) {
        error_response(
            &request.request_id,
            ErrorCode::ValidationFailed,
            &format!("validation failed: {}", err.message),
        )
    } else if !state.policy.allows(peer.as_ref()) {
        warn!(request_id = %request.request_id, ?peer, "caller is not allowed");
        error_response(
            &request.request_id,
            ErrorCode::PermissionDenied,
            &match peer {
                Some(peer) => format!("uid {} is not allowed", peer.uid),
                None => "caller credentials unavailable".to_string(),
            },
        )
    } else {
        ServiceResponse {
            request_id: request.request_id.clone(),
            result: Some(dispatch(&request.call, peer, state).await),
            error: None,
        }
    };

    write_response(&mut stream, &response).await?;

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    audit::append_record(audit_path, now_ms, peer, &request, &response).await?;

    Ok(())
}

async fn dispatch(call: &ServiceCall, peer: Option<audit::PeerCredentials>, state: &Arc<ServiceState>) -> CallResult {
    match call {
        ServiceCall::Ping => CallResult::Pong,
        ServiceCall::GetUid => CallResult::Uid {
            uid: unsafe { libc::geteuid() },
        },
        ServiceCall::GetPid => CallResult::Pid {
            pid: std::process::id(),
        },
        ServiceCall::SwitchComponent(call) => {
            let user_id = peer.map(|p| user_id_for_uid(p.uid)).unwrap_or(0);
            CallResult::SwitchComponent(switch_component(call.clone(), user_id, state).await)
        }
    }
}

async fn switch_component(call: SwitchComponentCall, user_id: u32, state: &Arc<ServiceState>) -> SwitchComponentResult {
    let pm = Arc::clone(&state.pm);
    let joined = tokio::task::spawn_blocking(move || {
        DirectController::new(pm, user_id).switch_component(&call.package_name, &call.component_name, call.state)
    })
    .await;

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "switch task did not complete");
            Err(ControlError::ProcessTerminatedUnexpectedly { status: None })
        }
    };
    debug!(user_id, ?outcome, "switch_component served");

    SwitchComponentResult {
        ok: matches!(outcome, Ok(true)),
        status: switch_status(&outcome),
    }
}

fn peer_credentials(stream: &UnixStream) -> Option<audit::PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    if len as usize != std::mem::size_of::<libc::ucred>() {
        return None;
    }

    Some(audit::PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

fn error_response(request_id: &str, code: ErrorCode, message: &str) -> ServiceResponse {
    ServiceResponse {
        request_id: request_id.to_string(),
        result: None,
        error: Some(RequestError {
            code,
            message: message.to_string(),
        }),
    }
}

async fn write_response(stream: &mut UnixStream, response: &ServiceResponse) -> anyhow::Result<()> {
    let response_json = serde_json::to_vec(response)?;
    stream.write_all(&response_json).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocker::bridge::Bridge;
    use blocker::pm::{CmdPackageManager, PmTools};
    use blocker_common::{ServiceRequest, SwitchStatus, PROTOCOL_VERSION};
    use std::path::PathBuf;

    struct Harness {
        _dir: tempfile::TempDir,
        socket_path: PathBuf,
        audit_path: PathBuf,
        pm_log: PathBuf,
        server: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.server.abort();
        }
    }

    async fn start(policy: CallerPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("sockets/blocker_pm.sock");
        let audit_path = dir.path().join("audit.jsonl");
        let pm_log = dir.path().join("pm.log");
        let pm_script = dir.path().join("pm");
        std::fs::write(
            &pm_script,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\ncase \"$*\" in\n  *Missing*) echo 'java.lang.IllegalArgumentException: Unknown component' 1>&2; exit 255 ;;\n  *Locked*) echo 'java.lang.SecurityException: Shell cannot change component state' 1>&2; exit 255 ;;\nesac\n",
                pm_log.display()
            ),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&pm_script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let tools = PmTools {
            pm: pm_script.to_string_lossy().to_string(),
            ..PmTools::default()
        };
        let pm = Arc::new(CmdPackageManager::new(tools, Arc::new(Bridge::new().unwrap())));
        let state = Arc::new(ServiceState { policy, pm });

        let server_socket = socket_path.clone();
        let server_audit = audit_path.to_string_lossy().to_string();
        let server = tokio::spawn(async move { run(&server_socket, &server_audit, state).await });

        for _ in 0..50u32 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        Harness {
            _dir: dir,
            socket_path,
            audit_path,
            pm_log,
            server,
        }
    }

    fn own_policy() -> CallerPolicy {
        CallerPolicy::new(unsafe { libc::geteuid() }, &[])
    }

    async fn send(socket_path: &Path, payload: &[u8]) -> ServiceResponse {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    fn request(request_id: &str, call: ServiceCall) -> Vec<u8> {
        serde_json::to_vec(&ServiceRequest {
            request_id: request_id.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            call,
        })
        .unwrap()
    }

    fn switch(component: &str) -> ServiceCall {
        ServiceCall::SwitchComponent(SwitchComponentCall {
            package_name: "com.example.app".to_string(),
            component_name: component.to_string(),
            state: blocker_common::ComponentState::Disabled,
        })
    }

    async fn audit_lines(path: &Path, expected: usize) -> Vec<serde_json::Value> {
        for _ in 0..50u32 {
            if let Ok(text) = tokio::fs::read_to_string(path).await {
                let lines: Vec<serde_json::Value> = text
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| serde_json::from_str(l).unwrap())
                    .collect();
                if lines.len() >= expected {
                    return lines;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("audit log never reached {expected} lines");
    }

    #[tokio::test]
    async fn ping_is_answered_and_audited_with_peer() {
        let h = start(own_policy()).await;
        let response = send(&h.socket_path, &request("req-ping-1", ServiceCall::Ping)).await;
        assert_eq!(response.request_id, "req-ping-1");
        assert_eq!(response.result, Some(CallResult::Pong));
        assert!(response.error.is_none());

        let lines = audit_lines(&h.audit_path, 1).await;
        assert_eq!(lines[0]["request_id"], "req-ping-1");
        assert_eq!(lines[0]["peer"]["pid"].as_u64().unwrap(), std::process::id() as u64);
        assert!(lines[0]["peer"]["uid"].is_number());
    }

    #[tokio::test]
    async fn diagnostics_report_daemon_ids() {
        let h = start(own_policy()).await;
        let uid = send(&h.socket_path, &request("req-uid", ServiceCall::GetUid)).await;
        assert_eq!(
            uid.result,
            Some(CallResult::Uid {
                uid: unsafe { libc::geteuid() }
            })
        );
        let pid = send(&h.socket_path, &request("req-pid", ServiceCall::GetPid)).await;
        assert_eq!(
            pid.result,
            Some(CallResult::Pid {
                pid: std::process::id()
            })
        );
    }

    #[tokio::test]
    async fn switch_runs_pm_as_the_callers_user() {
        let h = start(own_policy()).await;
        let response = send(&h.socket_path, &request("req-switch-1", switch("com.example.app.MainReceiver"))).await;
        assert_eq!(
            response.result,
            Some(CallResult::SwitchComponent(SwitchComponentResult {
                ok: true,
                status: SwitchStatus::Success,
            }))
        );

        let user_id = user_id_for_uid(unsafe { libc::geteuid() });
        let calls = tokio::fs::read_to_string(&h.pm_log).await.unwrap();
        assert_eq!(
            calls.trim(),
            format!("disable --user {user_id} com.example.app/com.example.app.MainReceiver")
        );
    }

    #[tokio::test]
    async fn pm_failures_map_onto_switch_status() {
        let h = start(own_policy()).await;
        let missing = send(&h.socket_path, &request("req-missing", switch("Missing"))).await;
        assert_eq!(
            missing.result,
            Some(CallResult::SwitchComponent(SwitchComponentResult {
                ok: false,
                status: SwitchStatus::ComponentNotFound,
            }))
        );

        let locked = send(&h.socket_path, &request("req-locked", switch("Locked"))).await;
        assert_eq!(
            locked.result,
            Some(CallResult::SwitchComponent(SwitchComponentResult {
                ok: false,
                status: SwitchStatus::PermissionDenied,
            }))
        );
    }

    #[tokio::test]
    async fn disallowed_peer_gets_permission_denied() {
        let h = start(CallerPolicy::only(&[])).await;
        let response = send(&h.socket_path, &request("req-denied", switch("Main"))).await;
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, ErrorCode::PermissionDenied);
        assert!(!h.pm_log.exists());

        let lines = audit_lines(&h.audit_path, 1).await;
        assert_eq!(lines[0]["response"]["error"]["code"], "permission_denied");
    }

    #[tokio::test]
    async fn invalid_identity_is_a_validation_failure() {
        let h = start(own_policy()).await;
        let response = send(&h.socket_path, &request("req-bad", switch("inner/Receiver"))).await;
        assert_eq!(response.request_id, "req-bad");
        assert_eq!(response.error.unwrap().code, ErrorCode::ValidationFailed);
        assert!(!h.pm_log.exists());
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_failure() {
        let h = start(own_policy()).await;
        let response = send(&h.socket_path, b"{\"request_id\":").await;
        assert_eq!(response.request_id, "unknown");
        assert_eq!(response.error.unwrap().code, ErrorCode::ParseFailed);
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let h = start(own_policy()).await;
        let payload = vec![b' '; MAX_REQUEST_BYTES + 1];
        let response = send(&h.socket_path, &payload).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::RequestTooLarge);
    }

    #[tokio::test]
    async fn idle_client_gets_a_timeout_error() {
        let h = start(own_policy()).await;
        let mut stream = UnixStream::connect(&h.socket_path).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let response: ServiceResponse = serde_json::from_slice(&out).unwrap();
        assert_eq!(response.error.unwrap().code, ErrorCode::ParseFailed);
    }
}
