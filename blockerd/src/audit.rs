// ABOUTME: appends one json line per served request with the caller's socket credentials.
// ABOUTME: records the request and the response as sent so denied and failed calls stay traceable.

use anyhow::Context;
use blocker_common::{ServiceRequest, ServiceResponse};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, serde::Serialize)]
#[serde(deny_unknown_fields)]
struct AuditRecord<'a> {
    ts_unix_ms: u64,
    peer: Option<PeerCredentials>,
    request_id: &'a str,
    request: &'a ServiceRequest,
    response: &'a ServiceResponse,
}

pub async fn append_record(
    audit_path: &str,
    ts_unix_ms: u64,
    peer: Option<PeerCredentials>,
    request: &ServiceRequest,
    response: &ServiceResponse,
) -> anyhow::Result<()> {
    let record = AuditRecord {
        ts_unix_ms,
        peer,
        request_id: request.request_id.as_str(),
        request,
        response,
    };

    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_path)
        .await
        .with_context(|| format!("open audit log at {audit_path}"))?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocker_common::{CallResult, ServiceCall, PROTOCOL_VERSION};

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let path_str = path.to_string_lossy().to_string();

        let request = ServiceRequest {
            request_id: "req-1".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            call: ServiceCall::Ping,
        };
        let response = ServiceResponse {
            request_id: "req-1".to_string(),
            result: Some(CallResult::Pong),
            error: None,
        };
        let peer = PeerCredentials {
            pid: 7,
            uid: 10123,
            gid: 10123,
        };

        append_record(&path_str, 1, Some(peer), &request, &response).await.unwrap();
        append_record(&path_str, 2, None, &request, &response).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["peer"]["uid"], 10123);
        assert_eq!(lines[0]["request"]["call"]["type"], "ping");
        assert_eq!(lines[0]["response"]["result"]["type"], "pong");
        assert!(lines[1]["peer"].is_null());
        assert_eq!(lines[1]["ts_unix_ms"], 2);
    }
}
