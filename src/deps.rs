//! Pre-flight host dependency check.
//!
//! Runs before anything touches the hypervisor; a missing tool is
//! fatal with no cleanup needed.

use std::ffi::OsStr;
use std::path::PathBuf;

use tracing::debug;

use crate::error::SessionError;

/// Host binaries a session shells out to.
pub const REQUIRED_TOOLS: &[&str] = &["virsh", "ldd"];

/// Verify every required tool resolves on `PATH`.
pub fn check_host_dependencies() -> Result<(), SessionError> {
    for tool in REQUIRED_TOOLS {
        match which(tool) {
            Some(path) => debug!(tool, path = %path.display(), "Dependency found"),
            None => return Err(SessionError::DependencyMissing(tool.to_string())),
        }
    }
    Ok(())
}

/// Resolve a binary name against the process `PATH`.
pub fn which(name: &str) -> Option<PathBuf> {
    which_in(name, std::env::var_os("PATH")?.as_os_str())
}

fn which_in(name: &str, path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn finds_executable_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("faketool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let found = which_in("faketool", dir.path().as_os_str()).unwrap();
        assert_eq!(found, tool);
    }

    #[test]
    fn skips_non_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("notatool");
        std::fs::write(&tool, "data").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(which_in("notatool", dir.path().as_os_str()).is_none());
    }

    #[test]
    fn missing_tool_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(which_in("definitely-absent", dir.path().as_os_str()).is_none());
    }
}
