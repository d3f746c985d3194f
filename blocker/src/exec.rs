// ABOUTME: runs privileged shell commands over one long-lived root session, one command at a time.
// ABOUTME: also spawns one-shot programs with bounded runtime and output for unprivileged tool calls.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::error::ExecError;

const MAX_STDIO_BYTES: usize = 64 * 1024;
const DONE_MARKER: &str = "__blocker_done_";
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub require_root: bool,
}

impl ShellConfig {
    pub fn su(timeout: Duration) -> Self {
        Self {
            program: "su".to_string(),
            args: vec![],
            env: vec![],
            timeout,
            require_root: true,
        }
    }

    /// A shell that runs with the caller's own privileges; used where root is provided some other way.
    pub fn unprivileged(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: vec![],
            timeout,
            require_root: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// Privileged command executor backed by a single reusable shell session.
pub struct RootShell {
    // Dropped before the bridge so the child's pipes deregister from a live runtime.
    session: Mutex<Option<Session>>,
    config: ShellConfig,
    sequence: AtomicU64,
    bridge: Arc<Bridge>,
}

impl RootShell {
    pub fn new(config: ShellConfig, bridge: Arc<Bridge>) -> Self {
        Self {
            session: Mutex::new(None),
            config,
            sequence: AtomicU64::new(0),
            bridge,
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Runs `command` and returns its stdout lines joined with `\n`.
    ///
    /// A nonzero exit status is not an error; use [`RootShell::run_with_status`] to see it.
    pub fn run(&self, command: &str) -> Result<String, ExecError> {
        self.run_with_status(command).map(|output| output.stdout)
    }

    pub fn run_with_status(&self, command: &str) -> Result<ShellOutput, ExecError> {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let marker = self.next_marker();
        debug!(command, "submitting privileged command");

        self.bridge.block_on(async {
            let mut session = match slot.take() {
                Some(session) => session,
                None => self.open().await?,
            };

            match tokio::time::timeout(self.config.timeout, session.submit(command, &marker)).await {
                Ok(Ok(output)) => {
                    *slot = Some(session);
                    Ok(output)
                }
                Ok(Err(SessionClosed)) => {
                    let status = session.reap().await;
                    warn!(command, ?status, "shell session terminated mid-command");
                    Err(ExecError::ProcessTerminatedUnexpectedly { status })
                }
                Err(_) => {
                    warn!(command, timeout = ?self.config.timeout, "command timed out; killing shell session");
                    session.kill().await;
                    Err(ExecError::Timeout(self.config.timeout))
                }
            }
        })
    }

    /// Opens the session if needed and reports whether privileged execution is possible.
    pub fn is_available(&self) -> bool {
        match self.run("true") {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "privileged shell unavailable");
                false
            }
        }
    }

    fn next_marker(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{DONE_MARKER}{}_{seq}:", std::process::id())
    }

    async fn open(&self) -> Result<Session, ExecError> {
        let mut session = Session::spawn(&self.config)
            .map_err(|err| ExecError::PrivilegeUnavailable(err.to_string()))?;

        let setup = async {
            session.submit("exec 2>&1", &self.next_marker()).await?;
            if self.config.require_root {
                return session.submit("id -u", &self.next_marker()).await.map(Some);
            }
            Ok::<_, SessionClosed>(None)
        };

        match tokio::time::timeout(self.config.timeout, setup).await {
            Ok(Ok(None)) => Ok(session),
            Ok(Ok(Some(id))) if id.stdout.trim() == "0" => {
                debug!(program = %self.config.program, "root shell session opened");
                Ok(session)
            }
            Ok(Ok(Some(id))) => {
                session.kill().await;
                Err(ExecError::PrivilegeUnavailable(format!(
                    "{} runs as uid {:?}, not root",
                    self.config.program,
                    id.stdout.trim()
                )))
            }
            Ok(Err(SessionClosed)) => {
                let status = session.reap().await;
                Err(ExecError::PrivilegeUnavailable(format!(
                    "{} exited with status {status:?} before granting a shell",
                    self.config.program
                )))
            }
            Err(_) => {
                session.kill().await;
                Err(ExecError::PrivilegeUnavailable(format!(
                    "{} did not answer within {:?}",
                    self.config.program, self.config.timeout
                )))
            }
        }
    }
}

#[derive(Debug)]
struct SessionClosed;

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Session {
    fn spawn(config: &ShellConfig) -> Result<Self, ExecError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ExecError::PrivilegeUnavailable(
                "shell pipes were not captured".to_string(),
            ));
        };

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn submit(&mut self, command: &str, marker: &str) -> Result<ShellOutput, SessionClosed> {
        let script = format!("{command}\necho \"{marker}$?\"\n");
        self.stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|_| SessionClosed)?;
        self.stdin.flush().await.map_err(|_| SessionClosed)?;

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self
                .stdout
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|_| SessionClosed)?;
            if n == 0 {
                return Err(SessionClosed);
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
            if let Some(idx) = line.find(marker) {
                let (before, after) = line.split_at(idx);
                if !before.is_empty() {
                    lines.push(before.to_string());
                }
                let exit_code = after[marker.len()..].trim().parse::<i32>().unwrap_or(-1);
                return Ok(ShellOutput {
                    stdout: lines.join("\n"),
                    exit_code,
                });
            }
            lines.push(line.to_string());
        }
    }

    async fn reap(&mut self) -> Option<i32> {
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => {
                self.kill().await;
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(error = %err, "kill shell session");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr; tools like `pm` report exceptions on either stream.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Spawns `argv` directly, without a shell, and waits for it with a bounded runtime.
pub async fn run_argv(
    argv: &[String],
    env: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let Some(program) = argv.first() else {
        return Err(ExecError::EmptyCommand);
    };

    let mut cmd = Command::new(program);
    cmd.args(&argv[1..])
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ExecError::Spawn {
                program: program.clone(),
                source,
            })
        }
        Err(_) => return Err(ExecError::Timeout(timeout)),
    };

    let (stdout, stdout_truncated) = truncate_bytes(&output.stdout);
    let (stderr, stderr_truncated) = truncate_bytes(&output.stderr);

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout,
        stdout_truncated,
        stderr,
        stderr_truncated,
    })
}

fn truncate_bytes(bytes: &[u8]) -> (String, bool) {
    if bytes.len() <= MAX_STDIO_BYTES {
        return (String::from_utf8_lossy(bytes).to_string(), false);
    }

    let mut out = String::from_utf8_lossy(&bytes[..MAX_STDIO_BYTES]).to_string();
    out.push_str("\n[truncated]\n");
    (out, true)
}

/// Quotes `value` as a single shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
