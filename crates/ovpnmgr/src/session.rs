//! Public supervisor API.
//!
//! [`OpenVpnSession`] serializes the caller-facing operations, owns the
//! connection-state variable and the forced-kill timer, and spawns one
//! worker thread per session. All session state beyond the status lives on
//! the worker; public calls reach it as control messages.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::error::StartError;
use crate::event::TunnelEvent;
use crate::helper::OsHelper;
use crate::launcher::{image_name, locate_openvpn};
use crate::proxy::ProxySettings;
use crate::worker::{Worker, WorkerHandles};

/// Connection state of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// The management socket is open but the tunnel is not up yet.
    ConnectedToSocket,
    Connected,
}

/// Signal that a stop was requested; polled by the worker at its
/// checkpoints.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timeouts and the management base port. `Default` carries production
/// values; shrink them for tests.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Base port the free-port probe starts from.
    pub default_port: u16,
    /// Wall-clock budget for the management socket to open after a launch.
    pub socket_wait: Duration,
    /// Deadline between the graceful-shutdown request and a forced kill.
    pub kill_timeout: Duration,
    /// Pause between failed launch attempts.
    pub launch_retry_pause: Duration,
    /// Pause before the single relaunch after the child died pre-socket.
    pub relaunch_pause: Duration,
    /// Pause between refused dial attempts.
    pub redial_pause: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            default_port: 62_100,
            socket_wait: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            launch_retry_pause: Duration::from_secs(1),
            relaunch_pause: Duration::from_secs(2),
            redial_pause: Duration::from_millis(100),
        }
    }
}

/// Static configuration of a supervisor instance.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path or name of the openvpn binary; resolved by [`locate_openvpn`]:
    /// literal path, then `PATH`, then platform fallback directories.
    pub openvpn_path: String,
    pub tunables: Tunables,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            openvpn_path: "openvpn".to_string(),
            tunables: Tunables::default(),
        }
    }
}

/// Per-connect parameters.
///
/// Credential values are written to the management channel inside double
/// quotes without escaping; values containing `"` or newlines must be
/// rejected or sanitized by the caller.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub config_path: PathBuf,
    /// May be empty; the session then emits `RequestUsername` when the
    /// server asks and waits for `continue_with_username_and_password`.
    pub username: String,
    /// May be empty; the session then emits `RequestPassword`.
    pub password: String,
    pub proxy: ProxySettings,
}

/// Messages posted from the controller to the worker, observed in FIFO
/// order.
pub(crate) enum ControlMsg {
    Disconnect,
    SubmitCredentials { username: String, password: String },
    SubmitPassword { password: String },
}

/// Single-shot forced-kill timer. Armed by `start_disconnect`, disarmed on
/// the disconnect path; fires at most once.
pub(crate) struct KillTimer {
    cancel_tx: Sender<()>,
}

impl KillTimer {
    pub(crate) fn arm(helper: Arc<dyn OsHelper>, image: String, deadline: Duration) -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || match cancel_rx.recv_timeout(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "openvpn did not exit within {:?} after the shutdown request, killing '{}'",
                    deadline,
                    image
                );
                helper.kill_by_image(&image);
            }
        });
        Self { cancel_tx }
    }

    pub(crate) fn stop(self) {
        let _ = self.cancel_tx.try_send(());
    }
}

/// Supervisor for one openvpn child at a time.
///
/// Runs at most one session; `start_connect` is only legal while
/// disconnected. Lifecycle events are delivered on the channel registered
/// with [`set_events_tx`](Self::set_events_tx).
pub struct OpenVpnSession {
    config: SessionConfig,
    helper: Arc<dyn OsHelper>,
    status: Arc<Mutex<ConnectionStatus>>,
    adapter_name: Arc<Mutex<String>>,
    events_tx: Arc<Mutex<Option<Sender<TunnelEvent>>>>,
    cancel: Mutex<CancellationToken>,
    ctrl_tx: Mutex<Option<Sender<ControlMsg>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    kill_timer: Arc<Mutex<Option<KillTimer>>>,
}

impl OpenVpnSession {
    pub fn new(config: SessionConfig, helper: Arc<dyn OsHelper>) -> Self {
        Self {
            config,
            helper,
            status: Arc::new(Mutex::new(ConnectionStatus::Disconnected)),
            adapter_name: Arc::new(Mutex::new(String::new())),
            events_tx: Arc::new(Mutex::new(None)),
            cancel: Mutex::new(CancellationToken::new()),
            ctrl_tx: Mutex::new(None),
            worker: Mutex::new(None),
            kill_timer: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers the channel lifecycle events are delivered on.
    pub fn set_events_tx(&self, tx: Sender<TunnelEvent>) {
        *self.events_tx.lock().unwrap() = Some(tx);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_disconnected(&self) -> bool {
        self.status() == ConnectionStatus::Disconnected
    }

    /// Name of the TUN/TAP adapter the child opened, or an empty string.
    pub fn connected_adapter_name(&self) -> String {
        self.adapter_name.lock().unwrap().clone()
    }

    /// Starts a session. Legal only while disconnected; the previous worker
    /// is joined before the new one spawns.
    pub fn start_connect(&self, request: ConnectRequest) -> Result<(), StartError> {
        if matches!(request.proxy, ProxySettings::Autodetect) {
            return Err(StartError::ProxyAutodetect);
        }

        {
            let mut status = self.status.lock().unwrap();
            if *status != ConnectionStatus::Disconnected {
                return Err(StartError::SessionActive);
            }
            *status = ConnectionStatus::Connecting;
        }

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.adapter_name.lock().unwrap().clear();
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded();
        *self.ctrl_tx.lock().unwrap() = Some(ctrl_tx);

        let mut worker = Worker::new(WorkerHandles {
            helper: Arc::clone(&self.helper),
            events_tx: Arc::clone(&self.events_tx),
            status: Arc::clone(&self.status),
            adapter_name: Arc::clone(&self.adapter_name),
            cancel,
            ctrl_rx,
            kill_timer: Arc::clone(&self.kill_timer),
            tunables: self.config.tunables.clone(),
            openvpn_path: self.config.openvpn_path.clone(),
            request,
        });
        *self.worker.lock().unwrap() = Some(thread::spawn(move || worker.run()));
        Ok(())
    }

    /// Requests a graceful shutdown and arms the forced-kill timer. When no
    /// session is live, emits `Disconnected` synchronously instead.
    /// Idempotent: repeated calls neither re-arm the timer nor re-send the
    /// shutdown request.
    pub fn start_disconnect(&self) {
        if self.is_disconnected() {
            self.emit(TunnelEvent::Disconnected);
            return;
        }

        {
            let mut timer = self.kill_timer.lock().unwrap();
            if timer.is_none() {
                *timer = Some(KillTimer::arm(
                    Arc::clone(&self.helper),
                    self.kill_image_name(),
                    self.config.tunables.kill_timeout,
                ));
            }
        }

        // The session may have ended between the state check and arming; a
        // timer left behind would fire against a child that already exited.
        if self.is_disconnected() {
            if let Some(timer) = self.kill_timer.lock().unwrap().take() {
                timer.stop();
            }
            return;
        }

        self.cancel.lock().unwrap().cancel();
        self.post(ControlMsg::Disconnect);
    }

    /// Answers a `RequestUsername` event.
    pub fn continue_with_username_and_password(&self, username: &str, password: &str) {
        self.post(ControlMsg::SubmitCredentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    /// Answers a `RequestPassword` event.
    pub fn continue_with_password(&self, password: &str) {
        self.post(ControlMsg::SubmitPassword {
            password: password.to_string(),
        });
    }

    fn post(&self, msg: ControlMsg) {
        if let Some(tx) = self.ctrl_tx.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }

    fn emit(&self, event: TunnelEvent) {
        if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn kill_image_name(&self) -> String {
        match locate_openvpn(&self.config.openvpn_path) {
            Some(binary) => image_name(&binary),
            None => image_name(Path::new(&self.config.openvpn_path)),
        }
    }
}

impl Drop for OpenVpnSession {
    fn drop(&mut self) {
        self.cancel.lock().unwrap().cancel();
        self.post(ControlMsg::Disconnect);
        *self.ctrl_tx.lock().unwrap() = None;
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::{CmdId, CmdStatus};
    use crate::launcher::LaunchSpec;
    use crate::error::TunnelError;
    use crossbeam_channel::Receiver;
    use std::collections::{HashMap, VecDeque};
    use std::io::{self, BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    /// What the fake helper does for one `execute_openvpn` call.
    enum LaunchPlan {
        /// Spawning fails outright.
        Fail,
        /// Spawns, but the child is already dead when polled.
        DeadChild,
        /// Spawns and stays "running" without ever opening the socket.
        Hang,
        /// Binds the management port and runs the script against the
        /// supervisor once it dials in.
        Serve(Box<dyn FnOnce(TcpStream) + Send>),
    }

    #[derive(Default)]
    struct FakeHelper {
        plans: Mutex<VecDeque<LaunchPlan>>,
        next_id: AtomicU64,
        finished: Mutex<HashMap<CmdId, bool>>,
        launches: Mutex<Vec<u16>>,
        cleared: Mutex<Vec<CmdId>>,
        kills: Mutex<Vec<String>>,
        children: Mutex<Vec<JoinHandle<()>>>,
    }

    impl FakeHelper {
        fn with_plans(plans: Vec<LaunchPlan>) -> Arc<Self> {
            let helper = Self::default();
            *helper.plans.lock().unwrap() = plans.into();
            Arc::new(helper)
        }

        fn launch_count(&self) -> usize {
            self.launches.lock().unwrap().len()
        }

        fn kill_count(&self) -> usize {
            self.kills.lock().unwrap().len()
        }

        /// Joins the scripted children, propagating their assertion
        /// failures. Only call after the session reported `Disconnected`.
        fn join_children(&self) {
            let handles: Vec<_> = self.children.lock().unwrap().drain(..).collect();
            for handle in handles {
                handle.join().expect("child script failed");
            }
        }
    }

    impl OsHelper for FakeHelper {
        fn execute_openvpn(&self, spec: &LaunchSpec) -> anyhow::Result<CmdId> {
            self.launches.lock().unwrap().push(spec.management_port);
            let plan = self.plans.lock().unwrap().pop_front();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match plan {
                None | Some(LaunchPlan::Fail) => anyhow::bail!("launch refused"),
                Some(LaunchPlan::DeadChild) => {
                    self.finished.lock().unwrap().insert(id, true);
                    Ok(id)
                }
                Some(LaunchPlan::Hang) => {
                    self.finished.lock().unwrap().insert(id, false);
                    Ok(id)
                }
                Some(LaunchPlan::Serve(script)) => {
                    let listener =
                        TcpListener::bind(("127.0.0.1", spec.management_port))?;
                    let handle = thread::spawn(move || {
                        if let Ok((stream, _)) = listener.accept() {
                            script(stream);
                        }
                    });
                    self.children.lock().unwrap().push(handle);
                    self.finished.lock().unwrap().insert(id, false);
                    Ok(id)
                }
            }
        }

        fn cmd_status(&self, id: CmdId) -> CmdStatus {
            let finished = self
                .finished
                .lock()
                .unwrap()
                .get(&id)
                .copied()
                .unwrap_or(true);
            CmdStatus {
                log: if finished {
                    "openvpn: exiting".to_string()
                } else {
                    String::new()
                },
                finished,
            }
        }

        fn clear_cmd(&self, id: CmdId) {
            self.cleared.lock().unwrap().push(id);
        }

        fn kill_by_image(&self, image: &str) {
            self.kills.lock().unwrap().push(image.to_string());
        }
    }

    /// The child's end of the management conversation.
    struct ChildEnd {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl ChildEnd {
        fn new(stream: TcpStream) -> Self {
            let writer = stream.try_clone().unwrap();
            Self {
                reader: BufReader::new(stream),
                writer,
            }
        }

        fn say(&mut self, line: &str) {
            writeln!(self.writer, "{}", line).unwrap();
        }

        fn expect(&mut self, want: &str) {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim_end(), want);
        }

        /// Asserts that nothing arrives within `window`.
        fn expect_silence(&mut self, window: Duration) {
            let stream = self.reader.get_ref();
            stream.set_read_timeout(Some(window)).unwrap();
            let mut buf = [0u8; 1];
            match stream.peek(&mut buf) {
                Ok(0) => panic!("peer closed during silence window"),
                Ok(_) => panic!("unexpected command during silence window"),
                Err(e) => assert!(
                    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                    "unexpected error: {e}"
                ),
            }
            stream.set_read_timeout(None).unwrap();
        }
    }

    fn test_session(
        base_port: u16,
        plans: Vec<LaunchPlan>,
        tweak: impl FnOnce(&mut Tunables),
    ) -> (OpenVpnSession, Receiver<TunnelEvent>, Arc<FakeHelper>) {
        let helper = FakeHelper::with_plans(plans);
        let mut tunables = Tunables {
            default_port: base_port,
            socket_wait: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            launch_retry_pause: Duration::from_millis(20),
            relaunch_pause: Duration::from_millis(50),
            redial_pause: Duration::from_millis(20),
        };
        tweak(&mut tunables);
        let config = SessionConfig {
            // Any existing file works as "the binary"; the fake helper
            // never actually runs it.
            openvpn_path: std::env::current_exe().unwrap().display().to_string(),
            tunables,
        };
        let session = OpenVpnSession::new(config, Arc::clone(&helper) as Arc<dyn OsHelper>);
        let (tx, rx) = crossbeam_channel::unbounded();
        session.set_events_tx(tx);
        (session, rx, helper)
    }

    fn request(username: &str, password: &str) -> ConnectRequest {
        ConnectRequest {
            config_path: PathBuf::from("client.ovpn"),
            username: username.to_string(),
            password: password.to_string(),
            proxy: ProxySettings::None,
        }
    }

    fn expect_event(rx: &Receiver<TunnelEvent>, want: TunnelEvent) {
        let got = rx
            .recv_timeout(Duration::from_secs(10))
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", want));
        assert_eq!(got, want);
    }

    fn stats(rx: u64, tx: u64) -> TunnelEvent {
        TunnelEvent::Statistics {
            rx,
            tx,
            total: false,
        }
    }

    #[test]
    fn happy_path_drives_the_setup_chain_and_reports_deltas() {
        let (session, events, helper) = test_session(
            42_500,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">HOLD:Waiting for hold release:0");
                child.expect("state on all");
                child.say("SUCCESS: real-time state notification set to ON");
                child.say("END");
                child.expect("log on");
                child.say("SUCCESS: real-time log notification set to ON");
                child.expect("bytecount 1");
                child.say("SUCCESS: bytecount interval changed");
                child.expect("hold release");
                child.say(">STATE:1652,CONNECTED,SUCCESS,10.8.0.2,185.2.3.4");
                child.say(">BYTECOUNT:100,200");
                child.say(">BYTECOUNT:150,260");
                child.say(">BYTECOUNT:150,260");
            }))],
            |_| {},
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(&events, TunnelEvent::Connected);
        expect_event(&events, stats(100, 200));
        expect_event(&events, stats(50, 60));
        expect_event(&events, stats(0, 0));
        expect_event(&events, TunnelEvent::Disconnected);

        assert!(session.is_disconnected());
        assert_eq!(helper.launch_count(), 1);
        assert_eq!(helper.kill_count(), 0);
        assert_eq!(helper.cleared.lock().unwrap().len(), 1);
        helper.join_children();
    }

    #[test]
    fn auth_failure_reports_the_error_and_requests_shutdown() {
        let (session, events, helper) = test_session(
            42_570,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">PASSWORD:Verification Failed: 'Auth'");
                child.expect("signal SIGTERM");
            }))],
            |_| {},
        );

        session.start_connect(request("u", "wrong")).unwrap();
        expect_event(&events, TunnelEvent::Error(TunnelError::AuthFailure));
        expect_event(&events, TunnelEvent::Disconnected);
        helper.join_children();
    }

    #[test]
    fn empty_username_suspends_until_the_caller_continues() {
        let (session, events, helper) = test_session(
            42_640,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">PASSWORD:Need 'Auth' username/password");
                child.expect("username \"Auth\" vpnuser");
                child.say("SUCCESS: 'Auth' username entered, but not yet verified");
                child.expect("password \"Auth\" vpnpass");
            }))],
            |_| {},
        );

        session.start_connect(request("", "")).unwrap();
        expect_event(&events, TunnelEvent::RequestUsername);
        session.continue_with_username_and_password("vpnuser", "vpnpass");
        expect_event(&events, TunnelEvent::Disconnected);
        helper.join_children();
    }

    #[test]
    fn empty_password_suspends_until_the_caller_continues() {
        let (session, events, helper) = test_session(
            42_710,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">PASSWORD:Need 'Auth' username/password");
                child.expect("username \"Auth\" vpnuser");
                child.say("SUCCESS: 'Auth' username entered, but not yet verified");
                child.expect("password \"Auth\" latepass");
            }))],
            |_| {},
        );

        session.start_connect(request("vpnuser", "")).unwrap();
        expect_event(&events, TunnelEvent::RequestPassword);
        session.continue_with_password("latepass");
        expect_event(&events, TunnelEvent::Disconnected);
        helper.join_children();
    }

    #[test]
    fn proxy_credentials_are_answered_without_prompting() {
        let (session, events, helper) = test_session(
            42_780,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">PASSWORD:Need 'HTTP Proxy' username/password");
                child.expect("username \"HTTP Proxy\" proxyuser");
                child.say("SUCCESS: 'HTTP Proxy' username entered, but not yet verified");
                child.expect("password \"HTTP Proxy\" proxypass");
            }))],
            |_| {},
        );

        let mut req = request("u", "p");
        req.proxy = ProxySettings::Http {
            address: "10.0.0.8".to_string(),
            port: 3128,
            username: "proxyuser".to_string(),
            password: "proxypass".to_string(),
        };
        session.start_connect(req).unwrap();
        expect_event(&events, TunnelEvent::Disconnected);
        helper.join_children();
    }

    #[test]
    fn reconnect_defers_the_shutdown_request_until_reenabled() {
        let (session, events, helper) = test_session(
            42_850,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">HOLD:Waiting for hold release:0");
                child.expect("state on all");
                child.say("SUCCESS: real-time state notification set to ON");
                child.say(">STATE:1700,RECONNECTING,ping-restart,,");
                // The disconnect request lands while SIGTERM is not
                // deliverable; nothing may arrive until notifications are
                // re-acknowledged.
                child.expect_silence(Duration::from_millis(300));
                child.say("SUCCESS: real-time state notification set to ON");
                child.expect("signal SIGTERM");
            }))],
            |_| {},
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(&events, TunnelEvent::Reconnecting);
        session.start_disconnect();
        expect_event(&events, TunnelEvent::Disconnected);
        assert_eq!(helper.kill_count(), 0, "graceful exit must disarm the timer");
        helper.join_children();
    }

    #[test]
    fn forced_kill_fires_when_the_child_ignores_the_shutdown_request() {
        let (session, events, helper) = test_session(
            42_920,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">HOLD:Waiting for hold release:0");
                child.expect("state on all");
                child.say("SUCCESS: real-time state notification set to ON");
                child.say(">STATE:1652,CONNECTED,SUCCESS,10.8.0.2,185.2.3.4");
                child.expect("signal SIGTERM");
                // Ignore it past the kill deadline.
                thread::sleep(Duration::from_millis(600));
            }))],
            |tunables| tunables.kill_timeout = Duration::from_millis(150),
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(&events, TunnelEvent::Connected);
        session.start_disconnect();
        // Idempotence: a second call must not re-arm anything.
        session.start_disconnect();
        expect_event(&events, TunnelEvent::Disconnected);

        let deadline = Instant::now() + Duration::from_secs(5);
        while helper.kill_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(helper.kill_count(), 1);
        helper.join_children();
    }

    #[test]
    fn dead_child_before_socket_gets_one_relaunch() {
        let (session, events, helper) = test_session(
            42_990,
            vec![LaunchPlan::DeadChild, LaunchPlan::DeadChild],
            |tunables| tunables.relaunch_pause = Duration::from_millis(30),
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(
            &events,
            TunnelEvent::Error(TunnelError::NoManagementSocket),
        );
        expect_event(&events, TunnelEvent::Disconnected);
        assert_eq!(helper.launch_count(), 2);
        // Tracking is only released when the socket connects or the dial
        // budget expires; a dead child is never cleared.
        assert_eq!(helper.cleared.lock().unwrap().len(), 0);
    }

    #[test]
    fn repeated_launch_failure_is_terminal_after_three_attempts() {
        let (session, events, helper) = test_session(
            43_060,
            vec![LaunchPlan::Fail, LaunchPlan::Fail, LaunchPlan::Fail],
            |_| {},
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(&events, TunnelEvent::Error(TunnelError::CantRunOpenVpn));
        expect_event(&events, TunnelEvent::Disconnected);
        assert_eq!(helper.launch_count(), 3);
    }

    #[test]
    fn socket_never_opening_exhausts_the_dial_budget() {
        let (session, events, helper) = test_session(
            43_130,
            vec![LaunchPlan::Hang],
            |tunables| tunables.socket_wait = Duration::from_millis(300),
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(
            &events,
            TunnelEvent::Error(TunnelError::NoManagementSocket),
        );
        expect_event(&events, TunnelEvent::Disconnected);
        assert_eq!(helper.launch_count(), 1);
        // Helper-side tracking is released on the failure path too.
        assert_eq!(helper.cleared.lock().unwrap().len(), 1);
    }

    #[test]
    fn start_connect_rejects_a_live_session() {
        let (session, events, _helper) = test_session(
            43_200,
            vec![LaunchPlan::Hang],
            |tunables| tunables.socket_wait = Duration::from_millis(300),
        );

        session.start_connect(request("u", "p")).unwrap();
        assert_eq!(
            session.start_connect(request("u", "p")),
            Err(StartError::SessionActive)
        );
        expect_event(
            &events,
            TunnelEvent::Error(TunnelError::NoManagementSocket),
        );
        expect_event(&events, TunnelEvent::Disconnected);
    }

    #[test]
    fn start_connect_rejects_proxy_autodetect() {
        let (session, _events, helper) = test_session(43_270, vec![], |_| {});
        let mut req = request("u", "p");
        req.proxy = ProxySettings::Autodetect;
        assert_eq!(
            session.start_connect(req),
            Err(StartError::ProxyAutodetect)
        );
        assert!(session.is_disconnected());
        assert_eq!(helper.launch_count(), 0);
    }

    #[test]
    fn disconnect_while_disconnected_reports_synchronously() {
        let (session, events, helper) = test_session(43_340, vec![], |_| {});
        session.start_disconnect();
        expect_event(&events, TunnelEvent::Disconnected);
        assert_eq!(helper.kill_count(), 0);
    }

    #[test]
    fn a_new_session_can_start_after_disconnect() {
        let script = || -> Box<dyn FnOnce(TcpStream) + Send> {
            Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">PASSWORD:Verification Failed: 'Auth'");
                child.expect("signal SIGTERM");
            })
        };
        let (session, events, helper) = test_session(
            43_410,
            vec![LaunchPlan::Serve(script()), LaunchPlan::Serve(script())],
            |_| {},
        );

        for _ in 0..2 {
            session.start_connect(request("u", "p")).unwrap();
            expect_event(&events, TunnelEvent::Error(TunnelError::AuthFailure));
            expect_event(&events, TunnelEvent::Disconnected);
        }
        assert_eq!(helper.launch_count(), 2);
        helper.join_children();
    }

    #[test]
    fn adapter_name_is_captured_from_the_tap_open_line() {
        let (session, events, helper) = test_session(
            43_480,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(
                    ">LOG:1,I,TAP-WIN32 device [LAN] opened: \\\\.\\Global\\{7BA5-11D0}.tap",
                );
                child.say(">STATE:1652,CONNECTED,SUCCESS,10.8.0.2,185.2.3.4");
            }))],
            |_| {},
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(&events, TunnelEvent::Connected);
        assert_eq!(session.connected_adapter_name(), "{7BA5-11D0}");
        expect_event(&events, TunnelEvent::Disconnected);
        helper.join_children();
    }

    #[test]
    fn the_tap_missing_error_is_reported_once_per_session() {
        let (session, events, helper) = test_session(
            43_550,
            vec![LaunchPlan::Serve(Box::new(|stream| {
                let mut child = ChildEnd::new(stream);
                child.say(">LOG:1,N,There are no TAP-Windows adapters on this system");
                child.expect("signal SIGTERM");
                child.say(">LOG:1,N,There are no TAP-Windows adapters on this system");
                // Give the supervisor a moment to (wrongly) re-emit before
                // the socket closes.
                thread::sleep(Duration::from_millis(100));
            }))],
            |_| {},
        );

        session.start_connect(request("u", "p")).unwrap();
        expect_event(&events, TunnelEvent::Error(TunnelError::NoTunTapAdapters));
        expect_event(&events, TunnelEvent::Disconnected);
        assert!(events.try_recv().is_err(), "error must not repeat");
        helper.join_children();
    }
}
