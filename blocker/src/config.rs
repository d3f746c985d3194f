// ABOUTME: collects the tunables the control library needs into one plain struct.
// ABOUTME: binaries fill it from command-line flags; tests build it directly.

use std::path::PathBuf;
use std::time::Duration;

use blocker_common::SERVICE_NAME;

use crate::controller::Backend;
use crate::exec::ShellConfig;
use crate::pm::PmTools;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SERVICE_DIR: &str = "/dev/socket";

#[derive(Debug, Clone)]
pub struct BlockerConfig {
    pub backend: Backend,
    pub shell: ShellConfig,
    pub pm: PmTools,
    pub getprop: String,
    pub service_dir: PathBuf,
    pub service_name: String,
    /// Where rule files are written before the root shell moves them into place.
    pub staging_dir: PathBuf,
    pub user_id: u32,
    pub command_timeout: Duration,
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            shell: ShellConfig::su(DEFAULT_COMMAND_TIMEOUT),
            pm: PmTools::default(),
            getprop: "getprop".to_string(),
            service_dir: PathBuf::from(DEFAULT_SERVICE_DIR),
            service_name: SERVICE_NAME.to_string(),
            staging_dir: std::env::temp_dir().join("blocker-ifw"),
            user_id: 0,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}
