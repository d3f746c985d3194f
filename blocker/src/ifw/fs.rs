// ABOUTME: implements the privileged file operations rule files need: exists, read, relocate and delete.
// ABOUTME: stages writes locally with 0644 permissions before a root shell copies them into secure storage.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::IfwError;
use crate::exec::{shell_quote, RootShell};

pub const RULE_FILE_MODE: u32 = 0o644;

pub struct PrivilegedFiles {
    shell: Arc<RootShell>,
}

impl PrivilegedFiles {
    pub fn new(shell: Arc<RootShell>) -> Self {
        Self { shell }
    }

    pub fn exists(&self, path: &Path) -> Result<bool, IfwError> {
        let quoted = quote_path(path);
        let output = self
            .shell
            .run(&format!("[ -f {quoted} ] && echo yes || echo no"))?;
        Ok(output.trim() == "yes")
    }

    pub fn read(&self, path: &Path) -> Result<String, IfwError> {
        self.checked(&format!("cat {}", quote_path(path)))
    }

    /// Copies `staging` over `dest` (overwriting) and sets `dest` to 0644.
    pub fn relocate(&self, staging: &Path, dest: &Path) -> Result<(), IfwError> {
        let dest_q = quote_path(dest);
        let mut command = String::new();
        if let Some(parent) = dest.parent() {
            command.push_str(&format!("mkdir -p {} && ", quote_path(parent)));
        }
        command.push_str(&format!(
            "cat {} > {dest_q} && chmod 644 {dest_q}",
            quote_path(staging)
        ));
        self.checked(&command)?;
        debug!(staging = %staging.display(), dest = %dest.display(), "relocated rule file");
        Ok(())
    }

    pub fn delete(&self, path: &Path) -> Result<(), IfwError> {
        self.checked(&format!("rm -f {}", quote_path(path)))?;
        debug!(path = %path.display(), "deleted rule file");
        Ok(())
    }

    fn checked(&self, command: &str) -> Result<String, IfwError> {
        let output = self.shell.run_with_status(command)?;
        if output.exit_code != 0 {
            return Err(IfwError::Command {
                command: command.to_string(),
                status: output.exit_code,
                output: output.stdout,
            });
        }
        Ok(output.stdout)
    }
}

/// Writes `content` to a local staging file readable by everyone, as the ifw service expects.
pub fn write_staging(path: &Path, content: &str) -> Result<(), IfwError> {
    let io_err = |source| IfwError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, content.as_bytes()).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(RULE_FILE_MODE);
        std::fs::set_permissions(path, perms).map_err(io_err)?;
    }
    Ok(())
}

pub fn remove_staging(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => debug!(path = %path.display(), error = %err, "remove staging file"),
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}
