//! The session worker: owns the child, the management socket and all
//! per-session state. Public calls reach it as [`ControlMsg`]s; everything
//! else is driven by reply lines.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{never, select, Receiver};

use crate::error::TunnelError;
use crate::event::TunnelEvent;
use crate::helper::OsHelper;
use crate::launcher::{locate_openvpn, ChildHandle, LaunchSpec};
use crate::logger::MGMT_LOG_TARGET;
use crate::management::ManagementChannel;
use crate::port;
use crate::protocol::{self, LogLine, Reply, StateChange};
use crate::session::{
    CancellationToken, ConnectRequest, ConnectionStatus, ControlMsg, KillTimer, Tunables,
};

/// Per-session flags and counters. Reset for every `start_connect`.
#[derive(Default)]
struct SessionVars {
    second_launch_attempted: bool,
    state_notification_active: bool,
    sigterm_acceptable: bool,
    sigterm_sent: bool,
    sigterm_pending: bool,
    tap_error_emitted: bool,
    first_byte_sample: bool,
    prev_rx: u64,
    prev_tx: u64,
}

impl SessionVars {
    fn new() -> Self {
        Self {
            first_byte_sample: true,
            ..Self::default()
        }
    }
}

/// One selected input in the protocol loop; `None` payloads mean the
/// corresponding channel closed.
enum Incoming {
    Line(Option<String>),
    Control(Option<ControlMsg>),
}

/// Handles shared between the supervisor and its worker.
pub(crate) struct WorkerHandles {
    pub helper: Arc<dyn OsHelper>,
    pub events_tx: Arc<Mutex<Option<crossbeam_channel::Sender<TunnelEvent>>>>,
    pub status: Arc<Mutex<ConnectionStatus>>,
    pub adapter_name: Arc<Mutex<String>>,
    pub cancel: CancellationToken,
    pub ctrl_rx: Receiver<ControlMsg>,
    pub kill_timer: Arc<Mutex<Option<KillTimer>>>,
    pub tunables: Tunables,
    pub openvpn_path: String,
    pub request: ConnectRequest,
}

pub(crate) struct Worker {
    handles: WorkerHandles,
    vars: SessionVars,
    username: String,
    password: String,
    disconnected_emitted: bool,
}

impl Worker {
    pub(crate) fn new(handles: WorkerHandles) -> Self {
        let username = handles.request.username.clone();
        let password = handles.request.password.clone();
        Self {
            handles,
            vars: SessionVars::new(),
            username,
            password,
            disconnected_emitted: false,
        }
    }

    pub(crate) fn run(&mut self) {
        if !self.handles.helper.ensure_firewall_service() {
            log::warn!("firewall service prerequisite could not be met");
        }

        let Some(binary) = locate_openvpn(&self.handles.openvpn_path) else {
            log::error!("could not locate openvpn at '{}'", self.handles.openvpn_path);
            self.fail(TunnelError::CantRunOpenVpn);
            return;
        };

        let Some(mut channel) = self.start_and_dial(&binary) else {
            // start_and_dial emitted the terminal events already.
            return;
        };

        self.set_status(ConnectionStatus::ConnectedToSocket);
        log::debug!("connected to the management socket");

        if self.handles.cancel.is_cancelled() && !self.handle_disconnect_request(&mut channel) {
            return;
        }

        let lines_rx = channel.lines().clone();
        let mut ctrl_rx = self.handles.ctrl_rx.clone();
        loop {
            let incoming = select! {
                recv(lines_rx) -> line => Incoming::Line(line.ok()),
                recv(ctrl_rx) -> msg => Incoming::Control(msg.ok()),
            };
            match incoming {
                Incoming::Line(Some(line)) => {
                    if !self.handle_line(&mut channel, &line) {
                        return;
                    }
                }
                Incoming::Line(None) => {
                    // EOF or read error: the child went away.
                    log::debug!("management socket closed");
                    self.finish_disconnected();
                    return;
                }
                Incoming::Control(Some(msg)) => {
                    if !self.handle_control(&mut channel, msg) {
                        return;
                    }
                }
                // The supervisor dropped its sender; keep serving the
                // socket until the child closes it.
                Incoming::Control(None) => ctrl_rx = never(),
            }
        }
    }

    /// Startup loop: pick a port, launch the child (with bounded retries),
    /// dial the management socket within the wall-clock budget. Relaunches
    /// once if the child dies before the socket opens. Returns `None` after
    /// emitting the terminal events for the failure paths.
    fn start_and_dial(&mut self, binary: &Path) -> Option<ManagementChannel> {
        loop {
            let Some(port) = port::pick_port(self.handles.tunables.default_port) else {
                log::error!("no free management port near {}", self.handles.tunables.default_port);
                self.fail(TunnelError::CantRunOpenVpn);
                return None;
            };

            let spec = LaunchSpec {
                binary: binary.to_path_buf(),
                config_path: self.handles.request.config_path.clone(),
                management_port: port,
                proxy: self.handles.request.proxy.clone(),
            };

            let started = Instant::now();
            let mut retries = 0;
            let child = loop {
                if self.handles.cancel.is_cancelled() {
                    self.finish_disconnected();
                    return None;
                }
                match self.handles.helper.execute_openvpn(&spec) {
                    Ok(id) => break ChildHandle::new(Arc::clone(&self.handles.helper), id),
                    Err(e) => {
                        log::warn!("failed to start openvpn: {}", e);
                        if retries >= 2 {
                            self.fail(TunnelError::CantRunOpenVpn);
                            return None;
                        }
                        retries += 1;
                        thread::sleep(self.handles.tunables.launch_retry_pause);
                    }
                }
            };
            log::debug!("openvpn started, management port {}", port);

            loop {
                match ManagementChannel::dial(port) {
                    Ok(channel) => {
                        child.release();
                        return Some(channel);
                    }
                    Err(_) => {
                        if started.elapsed() > self.handles.tunables.socket_wait {
                            log::error!(
                                "management socket did not open within {:?}",
                                self.handles.tunables.socket_wait
                            );
                            child.release();
                            self.fail(TunnelError::NoManagementSocket);
                            return None;
                        }

                        let status = child.status();
                        if status.finished {
                            log::warn!("openvpn exited before the management socket opened");
                            if !status.log.is_empty() {
                                log::debug!("openvpn output: {}", status.log.trim_end());
                            }

                            if self.handles.cancel.is_cancelled() {
                                self.finish_disconnected();
                                return None;
                            }
                            if !self.vars.second_launch_attempted {
                                log::debug!("relaunching openvpn once after a pause");
                                self.vars.second_launch_attempted = true;
                                thread::sleep(self.handles.tunables.relaunch_pause);
                                break; // back to port pick + launch
                            }
                            self.fail(TunnelError::NoManagementSocket);
                            return None;
                        }

                        thread::sleep(self.handles.tunables.redial_pause);
                    }
                }
            }
        }
    }

    /// Processes one reply line. Returns `false` when the session ended.
    fn handle_line(&mut self, channel: &mut ManagementChannel, line: &str) -> bool {
        if !protocol::is_bytecount(line) {
            log::debug!(target: MGMT_LOG_TARGET, "{}", line);
        }

        let ok = match protocol::classify(line) {
            Reply::HoldWaiting => self.send(channel, "state on all"),
            Reply::End => {
                if self.vars.state_notification_active {
                    self.send(channel, "log on")
                } else {
                    true
                }
            }
            Reply::StateNotificationOn => {
                self.vars.state_notification_active = true;
                self.vars.sigterm_acceptable = true;
                true
            }
            Reply::LogNotificationOn => self.send(channel, "bytecount 1"),
            Reply::BytecountIntervalChanged => self.send(channel, "hold release"),
            Reply::NeedAuthCredentials => {
                if self.username.is_empty() {
                    self.emit(TunnelEvent::RequestUsername);
                    true
                } else {
                    let cmd = format!("username \"Auth\" {}", self.username);
                    self.send(channel, &cmd)
                }
            }
            Reply::NeedProxyCredentials => {
                let cmd = format!(
                    "username \"HTTP Proxy\" {}",
                    self.handles.request.proxy.http_username()
                );
                self.send(channel, &cmd)
            }
            Reply::ProxyUsernamePending => {
                let cmd = format!(
                    "password \"HTTP Proxy\" {}",
                    self.handles.request.proxy.http_password()
                );
                self.send(channel, &cmd)
            }
            Reply::AuthUsernamePending => {
                if self.password.is_empty() {
                    self.emit(TunnelEvent::RequestPassword);
                    true
                } else {
                    let cmd = format!("password \"Auth\" {}", self.password);
                    self.send(channel, &cmd)
                }
            }
            Reply::AuthVerificationFailed => {
                self.emit(TunnelEvent::Error(TunnelError::AuthFailure));
                self.send_sigterm(channel)
            }
            Reply::NoTunTapAdapters => {
                if self.vars.tap_error_emitted {
                    true
                } else {
                    self.vars.tap_error_emitted = true;
                    self.emit(TunnelEvent::Error(TunnelError::NoTunTapAdapters));
                    self.send_sigterm(channel)
                }
            }
            Reply::Bytecount { rx, tx } => {
                self.update_statistics(rx, tx);
                true
            }
            Reply::State(StateChange::ConnectedSuccess) => {
                self.set_status(ConnectionStatus::Connected);
                self.emit(TunnelEvent::Connected);
                true
            }
            Reply::State(StateChange::ConnectedWithErrors) => {
                self.set_status(ConnectionStatus::Connected);
                self.emit(TunnelEvent::Error(TunnelError::ConnectedWithErrors));
                true
            }
            Reply::State(StateChange::Reconnecting) => {
                // SIGTERM is only deliverable once the child re-acknowledges
                // state notifications after the restart.
                self.vars.sigterm_acceptable = false;
                self.vars.state_notification_active = false;
                self.set_status(ConnectionStatus::ConnectedToSocket);
                self.emit(TunnelEvent::Reconnecting);
                true
            }
            Reply::State(StateChange::Other) => true,
            Reply::Log(LogLine::Error(kind)) => {
                self.emit(TunnelEvent::Error(kind));
                true
            }
            Reply::Log(LogLine::AdapterOpened(Some(name))) => {
                *self.handles.adapter_name.lock().unwrap() = name;
                true
            }
            Reply::Log(LogLine::AdapterOpened(None)) => {
                self.handles.adapter_name.lock().unwrap().clear();
                log::debug!("could not parse the adapter name from: {}", line);
                true
            }
            Reply::Log(LogLine::Other) => true,
            Reply::AllTapAdaptersInUse => {
                self.emit(TunnelEvent::Error(TunnelError::AllTapAdaptersInUse));
                true
            }
            Reply::Other => true,
        };

        if !ok {
            return false;
        }
        self.flush_pending_sigterm(channel)
    }

    fn handle_control(&mut self, channel: &mut ManagementChannel, msg: ControlMsg) -> bool {
        match msg {
            ControlMsg::Disconnect => self.handle_disconnect_request(channel),
            ControlMsg::SubmitCredentials { username, password } => {
                self.username = username;
                self.password = password;
                let cmd = format!("username \"Auth\" {}", self.username);
                if !self.send(channel, &cmd) {
                    return false;
                }
                self.flush_pending_sigterm(channel)
            }
            ControlMsg::SubmitPassword { password } => {
                self.password = password;
                let cmd = format!("password \"Auth\" {}", self.password);
                if !self.send(channel, &cmd) {
                    return false;
                }
                self.flush_pending_sigterm(channel)
            }
        }
    }

    /// The graceful-shutdown request. SIGTERM goes out immediately when the
    /// child currently accepts it, otherwise it is parked until the next
    /// transition to acceptable.
    fn handle_disconnect_request(&mut self, channel: &mut ManagementChannel) -> bool {
        let status = *self.handles.status.lock().unwrap();
        let live = matches!(
            status,
            ConnectionStatus::ConnectedToSocket | ConnectionStatus::Connected
        );
        if !self.vars.sigterm_sent && live {
            if self.vars.sigterm_acceptable {
                return self.send_sigterm(channel);
            }
            self.vars.sigterm_pending = true;
        }
        true
    }

    fn flush_pending_sigterm(&mut self, channel: &mut ManagementChannel) -> bool {
        if self.vars.sigterm_pending && self.vars.sigterm_acceptable && !self.vars.sigterm_sent {
            return self.send_sigterm(channel);
        }
        true
    }

    fn send_sigterm(&mut self, channel: &mut ManagementChannel) -> bool {
        if self.vars.sigterm_sent {
            return true;
        }
        self.vars.sigterm_sent = true;
        self.send(channel, "signal SIGTERM")
    }

    fn update_statistics(&mut self, rx: u64, tx: u64) {
        if self.vars.first_byte_sample {
            self.vars.first_byte_sample = false;
            self.vars.prev_rx = rx;
            self.vars.prev_tx = tx;
            self.emit(TunnelEvent::Statistics {
                rx,
                tx,
                total: false,
            });
        } else {
            let delta_rx = rx.saturating_sub(self.vars.prev_rx);
            let delta_tx = tx.saturating_sub(self.vars.prev_tx);
            self.vars.prev_rx = rx;
            self.vars.prev_tx = tx;
            self.emit(TunnelEvent::Statistics {
                rx: delta_rx,
                tx: delta_tx,
                total: false,
            });
        }
    }

    /// Writes one command; a failed write ends the session.
    fn send(&mut self, channel: &mut ManagementChannel, command: &str) -> bool {
        if let Err(e) = channel.send(command) {
            log::warn!("write to the management socket failed: {}", e);
            self.finish_disconnected();
            return false;
        }
        true
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.handles.status.lock().unwrap() = status;
    }

    fn emit(&self, event: TunnelEvent) {
        if let Some(tx) = self.handles.events_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Terminal error path: report the error, then close the session.
    fn fail(&mut self, error: TunnelError) {
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(TunnelEvent::Error(error));
        self.finish_disconnected();
    }

    /// The one place a session ends: disarms the kill timer, flips the state
    /// and emits `Disconnected` exactly once.
    fn finish_disconnected(&mut self) {
        if let Some(timer) = self.handles.kill_timer.lock().unwrap().take() {
            timer.stop();
        }
        self.set_status(ConnectionStatus::Disconnected);
        if !self.disconnected_emitted {
            self.disconnected_emitted = true;
            self.emit(TunnelEvent::Disconnected);
        }
    }
}
