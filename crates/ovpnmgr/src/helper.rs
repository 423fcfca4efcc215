//! OS-helper seam: the privileged service that actually runs processes.
//!
//! The session worker never spawns or kills anything itself; it goes through
//! [`OsHelper`]. The default backend, [`ProcessHelper`], runs children
//! directly in this process. Deployments with a privileged helper service
//! substitute their own implementation.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::launcher::{management_args, LaunchSpec};

/// Token identifying a child started through the helper.
pub type CmdId = u64;

/// Non-blocking snapshot of a child's state.
#[derive(Debug, Clone, Default)]
pub struct CmdStatus {
    /// Output accumulated from the child's stdout/stderr so far.
    pub log: String,
    /// True once the child has exited.
    pub finished: bool,
}

pub trait OsHelper: Send + Sync {
    /// Spawns the tunneling binary; the child runs unblocked.
    fn execute_openvpn(&self, spec: &LaunchSpec) -> anyhow::Result<CmdId>;

    /// Non-blocking poll of a child started with [`execute_openvpn`].
    ///
    /// Unknown ids report as finished with an empty log.
    ///
    /// [`execute_openvpn`]: OsHelper::execute_openvpn
    fn cmd_status(&self, id: CmdId) -> CmdStatus;

    /// Releases helper-side tracking for a child. The child keeps running.
    fn clear_cmd(&self, id: CmdId);

    /// Forcibly terminates every process with the given image name.
    fn kill_by_image(&self, image: &str);

    /// Ensures platform firewall prerequisites are met (the Base Filtering
    /// Engine service on Windows). Returns `false` if they could not be met.
    fn ensure_firewall_service(&self) -> bool {
        true
    }
}

struct TrackedChild {
    child: Child,
    log: Arc<Mutex<String>>,
}

/// [`OsHelper`] backend that spawns children in-process with
/// `std::process::Command`, capturing their output on reader threads.
#[derive(Default)]
pub struct ProcessHelper {
    next_id: AtomicU64,
    children: Mutex<HashMap<CmdId, TrackedChild>>,
}

impl ProcessHelper {
    pub fn new() -> Self {
        Self::default()
    }

    fn capture<R: Read + Send + 'static>(stream: R, log: Arc<Mutex<String>>) {
        thread::spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let mut log = log.lock().unwrap();
                log.push_str(&line);
                log.push('\n');
            }
        });
    }
}

impl OsHelper for ProcessHelper {
    fn execute_openvpn(&self, spec: &LaunchSpec) -> anyhow::Result<CmdId> {
        let mut child = Command::new(&spec.binary)
            .args(management_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let log = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            Self::capture(stdout, Arc::clone(&log));
        }
        if let Some(stderr) = child.stderr.take() {
            Self::capture(stderr, Arc::clone(&log));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.children
            .lock()
            .unwrap()
            .insert(id, TrackedChild { child, log });
        Ok(id)
    }

    fn cmd_status(&self, id: CmdId) -> CmdStatus {
        let mut children = self.children.lock().unwrap();
        let Some(tracked) = children.get_mut(&id) else {
            return CmdStatus {
                log: String::new(),
                finished: true,
            };
        };
        let status = CmdStatus {
            log: tracked.log.lock().unwrap().clone(),
            finished: !matches!(tracked.child.try_wait(), Ok(None)),
        };
        status
    }

    fn clear_cmd(&self, id: CmdId) {
        if let Some(tracked) = self.children.lock().unwrap().remove(&id) {
            // Reap the child whenever it eventually exits so it does not
            // linger as a zombie; the process itself keeps running.
            let mut child = tracked.child;
            thread::spawn(move || {
                let _ = child.wait();
            });
        }
    }

    fn kill_by_image(&self, image: &str) {
        kill_by_image_impl(image);
    }

    fn ensure_firewall_service(&self) -> bool {
        ensure_firewall_service_impl()
    }
}

#[cfg(unix)]
fn kill_by_image_impl(image: &str) {
    log::info!("killing '{}' via pkill", image);
    let status = Command::new("pkill")
        .arg("-f")
        .arg(image)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        log::warn!("pkill -f {} failed: {}", image, e);
    }
}

#[cfg(windows)]
fn kill_by_image_impl(image: &str) {
    log::info!("killing '{}' via taskkill", image);
    let status = Command::new("taskkill")
        .args(["/F", "/T", "/IM", image])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        log::warn!("taskkill /IM {} failed: {}", image, e);
    }
}

#[cfg(unix)]
fn ensure_firewall_service_impl() -> bool {
    true
}

/// Queries the Base Filtering Engine service and starts it if needed, with
/// two bounded attempts. The packet filter cannot come up without it.
#[cfg(windows)]
fn ensure_firewall_service_impl() -> bool {
    use std::time::{Duration, Instant};

    fn bfe_running() -> bool {
        Command::new("sc")
            .args(["query", "BFE"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains("RUNNING"))
            .unwrap_or(false)
    }

    if bfe_running() {
        return true;
    }
    log::warn!("Base Filtering Engine service is not running, starting it");

    for _ in 0..2 {
        let _ = Command::new("sc")
            .args(["start", "BFE"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if bfe_running() {
                return true;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
    false
}
