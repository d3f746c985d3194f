// ABOUTME: runs the privileged blocker_pm service that switches components for authorized local callers.
// ABOUTME: listens on a unix socket named after the service and writes an audit log for each request.

mod audit;
mod policy;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blocker::bridge::Bridge;
use blocker::config::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_SERVICE_DIR};
use blocker::controller::service::socket_path;
use blocker::pm::{CmdPackageManager, PmTools};
use blocker_common::SERVICE_NAME;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "blockerd")]
struct Args {
    #[arg(long, env = "BLOCKER_SERVICE_DIR", default_value = DEFAULT_SERVICE_DIR)]
    service_dir: PathBuf,

    #[arg(long, env = "BLOCKER_SERVICE_NAME", default_value = SERVICE_NAME)]
    service_name: String,

    #[arg(long, default_value = "./blockerd-audit.jsonl")]
    audit_path: String,

    /// Extra caller uid to trust besides root and the daemon's own uid.
    #[arg(long = "allow-uid")]
    allow_uids: Vec<u32>,

    #[arg(long, env = "BLOCKER_PM", default_value = "pm")]
    pm_program: String,

    #[arg(long, env = "BLOCKER_DUMPSYS", default_value = "dumpsys")]
    dumpsys_program: String,

    #[arg(long, env = "BLOCKER_COMMAND_TIMEOUT_SEC", default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    command_timeout_sec: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let tools = PmTools {
        pm: args.pm_program,
        dumpsys: args.dumpsys_program,
        timeout: Duration::from_secs(args.command_timeout_sec),
        ..PmTools::default()
    };
    let bridge = Arc::new(Bridge::new().context("start package manager runtime")?);
    let state = Arc::new(server::ServiceState {
        policy: policy::CallerPolicy::new(unsafe { libc::geteuid() }, &args.allow_uids),
        pm: Arc::new(CmdPackageManager::new(tools, bridge)),
    });

    let socket = socket_path(&args.service_dir, &args.service_name);
    server::run(&socket, &args.audit_path, state).await
}
