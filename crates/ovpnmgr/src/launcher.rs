//! Launching the tunneling binary and tracking the resulting child.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use which::which;

use crate::helper::{CmdId, CmdStatus, OsHelper};
use crate::proxy::ProxySettings;

/// Everything the helper needs to start one openvpn child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Resolved path of the binary to run.
    pub binary: PathBuf,
    /// Path of the configuration file handed to `--config`.
    pub config_path: PathBuf,
    /// Loopback port for the management channel.
    pub management_port: u16,
    pub proxy: ProxySettings,
}

/// Composes the openvpn command line: config, management endpoint in hold
/// mode with password queries routed through the channel, plus proxy flags.
pub fn management_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "--config".to_string(),
        spec.config_path.display().to_string(),
        "--management".to_string(),
        "127.0.0.1".to_string(),
        spec.management_port.to_string(),
        "--management-query-passwords".to_string(),
        "--management-hold".to_string(),
    ];
    spec.proxy.append_args(&mut args);
    args
}

/// Handle to a child started through the helper.
///
/// Wraps the helper-side command id with non-blocking status polling and the
/// explicit release of helper tracking once the supervisor no longer needs
/// the child's exit state.
pub struct ChildHandle {
    helper: Arc<dyn OsHelper>,
    cmd_id: CmdId,
}

impl ChildHandle {
    pub(crate) fn new(helper: Arc<dyn OsHelper>, cmd_id: CmdId) -> Self {
        Self { helper, cmd_id }
    }

    pub fn status(&self) -> CmdStatus {
        self.helper.cmd_status(self.cmd_id)
    }

    /// Drops helper-side tracking. The child keeps running.
    pub fn release(&self) {
        self.helper.clear_cmd(self.cmd_id);
    }
}

/// Attempts to locate the openvpn executable.
///
/// Resolution order:
/// 1. `user_path` as a literal file path.
/// 2. `user_path` looked up via `PATH`.
/// 3. Platform-specific fallback directories.
pub fn locate_openvpn(user_path: &str) -> Option<PathBuf> {
    let candidate = Path::new(user_path);
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    if let Ok(found) = which(user_path) {
        return Some(found);
    }

    platform_fallback()
}

#[cfg(unix)]
fn platform_fallback() -> Option<PathBuf> {
    let dirs = [
        "/sbin",
        "/usr/sbin",
        "/usr/local/sbin",
        "/usr/local/bin",
        "/opt/homebrew/bin",
    ];
    dirs.iter()
        .map(|dir| Path::new(dir).join("openvpn"))
        .find(|p| p.is_file())
}

#[cfg(windows)]
fn platform_fallback() -> Option<PathBuf> {
    // Check next to our own executable (bundled distribution).
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let bundled = parent.join("openvpn").join("openvpn.exe");
            if bundled.is_file() {
                return Some(bundled);
            }
        }
    }

    let common = [
        "C:\\Program Files\\OpenVPN\\bin\\openvpn.exe",
        "C:\\Program Files (x86)\\OpenVPN\\bin\\openvpn.exe",
    ];
    common
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(|p| p.to_path_buf())
}

#[cfg(not(any(unix, windows)))]
fn platform_fallback() -> Option<PathBuf> {
    None
}

/// File name of the binary, used as the image name for a forced kill.
pub fn image_name(binary: &Path) -> String {
    binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string())
}
