// ABOUTME: resolves the secure-storage directory that holds intent firewall rule files.
// ABOUTME: isolates the encrypted-filesystem check behind a fallible function with a plain-path default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::bridge::Bridge;
use crate::exec::run_argv;

pub const DATA_DIR_ENV: &str = "ANDROID_DATA";
pub const SECURE_DATA_DIR_ENV: &str = "ANDROID_SECURE_DATA";
pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_SECURE_DATA_DIR: &str = "/data/secure";
pub const EFS_PROPERTY: &str = "persist.security.efs.enabled";

const IFW_FOLDER: &str = "ifw";
const RULE_EXTENSION: &str = ".xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    system_root: PathBuf,
}

impl StoragePaths {
    /// Picks the secure base when the encrypted filesystem is on, the plain base otherwise.
    ///
    /// `lookup` supplies environment values; `efs_check` failures count as "disabled".
    pub fn resolve<L, P>(lookup: L, efs_check: P) -> Self
    where
        L: Fn(&str) -> Option<String>,
        P: FnOnce() -> anyhow::Result<bool>,
    {
        let encrypted = match efs_check() {
            Ok(enabled) => enabled,
            Err(err) => {
                debug!(error = %err, "encrypted filesystem check failed; assuming disabled");
                false
            }
        };

        let base = if encrypted {
            dir_from_env(&lookup, SECURE_DATA_DIR_ENV, DEFAULT_SECURE_DATA_DIR)
        } else {
            dir_from_env(&lookup, DATA_DIR_ENV, DEFAULT_DATA_DIR)
        };
        Self::with_base(base)
    }

    /// Resolves against the process environment and the device property store.
    pub fn from_system(bridge: &Bridge, getprop: &str, timeout: Duration) -> Self {
        Self::resolve(
            |key| std::env::var(key).ok(),
            || detect_encrypted_filesystem(bridge, getprop, timeout),
        )
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            system_root: base.into().join("system"),
        }
    }

    /// `<base>/system/ifw/`
    pub fn ifw_folder(&self) -> PathBuf {
        self.system_root.join(IFW_FOLDER)
    }

    pub fn rule_file(&self, package_name: &str) -> PathBuf {
        self.ifw_folder()
            .join(format!("{package_name}{RULE_EXTENSION}"))
    }

    /// True when `path` is a direct child of the rule folder and the folder ends in `ifw`.
    pub fn is_inside_ifw_folder(&self, path: &Path) -> bool {
        let folder = self.ifw_folder();
        folder.file_name().is_some_and(|name| name == IFW_FOLDER)
            && path.parent() == Some(folder.as_path())
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.is_empty() && name != "." && name != "..")
    }
}

fn dir_from_env<L>(lookup: &L, key: &str, default: &str) -> PathBuf
where
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => PathBuf::from(default),
    }
}

fn detect_encrypted_filesystem(bridge: &Bridge, getprop: &str, timeout: Duration) -> anyhow::Result<bool> {
    let argv = vec![getprop.to_string(), EFS_PROPERTY.to_string()];
    let output = bridge.block_on(run_argv(&argv, &[], timeout))?;
    if !output.success() {
        anyhow::bail!("{getprop} exited with {:?}", output.exit_code);
    }
    Ok(matches!(output.stdout.trim(), "true" | "1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_to_plain_data_dir() {
        let paths = StoragePaths::resolve(env(&[]), || Ok(false));
        assert_eq!(paths.ifw_folder(), PathBuf::from("/data/system/ifw"));
        assert_eq!(
            paths.rule_file("com.example.app"),
            PathBuf::from("/data/system/ifw/com.example.app.xml")
        );
    }

    #[test]
    fn encrypted_filesystem_uses_secure_dir() {
        let paths = StoragePaths::resolve(env(&[(SECURE_DATA_DIR_ENV, "/mnt/secure")]), || Ok(true));
        assert_eq!(paths.ifw_folder(), PathBuf::from("/mnt/secure/system/ifw"));

        let paths = StoragePaths::resolve(env(&[]), || Ok(true));
        assert_eq!(paths.ifw_folder(), PathBuf::from("/data/secure/system/ifw"));
    }

    #[test]
    fn env_override_applies_to_plain_dir() {
        let paths = StoragePaths::resolve(
            env(&[(DATA_DIR_ENV, "/tmp/android-data"), (SECURE_DATA_DIR_ENV, "/nope")]),
            || Ok(false),
        );
        assert_eq!(paths.ifw_folder(), PathBuf::from("/tmp/android-data/system/ifw"));
    }

    #[test]
    fn detection_failure_falls_back_to_plain_dir() {
        let paths = StoragePaths::resolve(env(&[]), || anyhow::bail!("no property service"));
        assert_eq!(paths.ifw_folder(), PathBuf::from("/data/system/ifw"));
    }

    #[test]
    fn missing_getprop_falls_back_to_plain_dir() {
        let bridge = Bridge::new().unwrap();
        let result = detect_encrypted_filesystem(&bridge, "/nonexistent/getprop", Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn inside_check_rejects_escapes() {
        let paths = StoragePaths::with_base("/data");
        assert!(paths.is_inside_ifw_folder(Path::new("/data/system/ifw/com.example.app.xml")));
        assert!(!paths.is_inside_ifw_folder(Path::new("/data/system/com.example.app.xml")));
        assert!(!paths.is_inside_ifw_folder(Path::new("/data/system/ifw/../packages.xml")));
        assert!(!paths.is_inside_ifw_folder(Path::new("/data/system/ifw/sub/x.xml")));
    }
}
