//! Classification of management-channel reply lines.
//!
//! The management protocol is free-form text; replies are recognized by
//! case-insensitive substring matching, in a fixed order. The functions here
//! are pure so the session worker stays a thin driver over them.

use crate::error::TunnelError;

/// One classified reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The child is parked in management hold.
    HoldWaiting,
    /// An `END` terminator. Only meaningful while state notifications are
    /// active; the worker gates on that.
    End,
    /// `state on all` acknowledged.
    StateNotificationOn,
    /// `log on` acknowledged.
    LogNotificationOn,
    /// `bytecount` interval acknowledged.
    BytecountIntervalChanged,
    /// The server wants the `Auth` username (and then password).
    NeedAuthCredentials,
    /// The server wants HTTP proxy credentials.
    NeedProxyCredentials,
    /// Proxy username accepted, password expected next.
    ProxyUsernamePending,
    /// `Auth` username accepted, password expected next.
    AuthUsernamePending,
    /// Credential verification failed.
    AuthVerificationFailed,
    /// No TUN/TAP adapters are installed.
    NoTunTapAdapters,
    /// Parsed byte counters.
    Bytecount { rx: u64, tx: u64 },
    /// A `>STATE:` lifecycle notification.
    State(StateChange),
    /// A `>LOG:` line.
    Log(LogLine),
    /// Every TAP adapter is in use (fatal).
    AllTapAdaptersInUse,
    /// Anything else.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    ConnectedSuccess,
    ConnectedWithErrors,
    Reconnecting,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    /// A log pattern mapped to a typed error.
    Error(TunnelError),
    /// The TAP device was opened; carries the `{...}` adapter name when the
    /// line could be parsed.
    AdapterOpened(Option<String>),
    Other,
}

/// True for byte-counter lines, parsable or not. Used to keep them out of
/// the debug log.
pub fn is_bytecount(line: &str) -> bool {
    line.to_ascii_lowercase().contains(">bytecount:")
}

/// Classifies one trimmed reply line. Rule order matters and mirrors the
/// conversation: hold and acknowledgement replies first, then credential
/// prompts, then the notification streams.
pub fn classify(line: &str) -> Reply {
    let lower = line.to_ascii_lowercase();

    if lower.contains("hold:waiting for hold release") {
        Reply::HoldWaiting
    } else if line.starts_with("END") {
        Reply::End
    } else if lower.contains("success: real-time state notification set to on") {
        Reply::StateNotificationOn
    } else if lower.contains("success: real-time log notification set to on") {
        Reply::LogNotificationOn
    } else if lower.contains("success: bytecount interval changed") {
        Reply::BytecountIntervalChanged
    } else if lower.contains("password:need 'auth' username/password") {
        Reply::NeedAuthCredentials
    } else if lower.contains("password:need 'http proxy' username/password") {
        Reply::NeedProxyCredentials
    } else if lower.contains("'http proxy' username entered, but not yet verified") {
        Reply::ProxyUsernamePending
    } else if lower.contains("'auth' username entered, but not yet verified") {
        Reply::AuthUsernamePending
    } else if lower.contains("password:verification failed: 'auth'") {
        Reply::AuthVerificationFailed
    } else if lower.contains("there are no tap-windows adapters on this system") {
        Reply::NoTunTapAdapters
    } else if lower.starts_with(">bytecount:") {
        match parse_bytecount(line) {
            Some((rx, tx)) => Reply::Bytecount { rx, tx },
            None => Reply::Other,
        }
    } else if lower.starts_with(">state:") {
        Reply::State(classify_state(&lower))
    } else if lower.starts_with(">log:") {
        Reply::Log(classify_log(line, &lower))
    } else if lower.contains(">fatal:all tap-windows adapters on this system are currently in use")
    {
        Reply::AllTapAdaptersInUse
    } else {
        Reply::Other
    }
}

fn classify_state(lower: &str) -> StateChange {
    if lower.contains("connected,success") {
        StateChange::ConnectedSuccess
    } else if lower.contains("connected,error") {
        StateChange::ConnectedWithErrors
    } else if lower.contains("reconnecting") {
        StateChange::Reconnecting
    } else {
        StateChange::Other
    }
}

fn classify_log(line: &str, lower: &str) -> LogLine {
    let udp = lower.contains("udp");
    if udp && lower.contains("no buffer space available (wsaenobufs) (code=10055)") {
        LogLine::Error(TunnelError::UdpCantAssign)
    } else if udp && lower.contains("no route to host (wsaehostunreach) (code=10065)") {
        LogLine::Error(TunnelError::UdpCantAssign)
    } else if udp && lower.contains("can't assign requested address (code=49)") {
        LogLine::Error(TunnelError::UdpCantAssign)
    } else if udp && lower.contains("no buffer space available (code=55)") {
        LogLine::Error(TunnelError::UdpNoBufferSpace)
    } else if udp && lower.contains("network is down (code=50)") {
        LogLine::Error(TunnelError::UdpNetworkDown)
    } else if lower.contains("tcp") && lower.contains("failed") {
        LogLine::Error(TunnelError::TcpFailed)
    } else if lower.contains("initialization sequence completed with errors") {
        LogLine::Error(TunnelError::InitSequenceErrors)
    } else if lower.contains("tap-win32 device") && lower.contains("opened") {
        LogLine::AdapterOpened(extract_braced(line))
    } else {
        LogLine::Other
    }
}

/// Pulls the two decimal counters out of `>BYTECOUNT:rx,tx`.
fn parse_bytecount(line: &str) -> Option<(u64, u64)> {
    let counters = line.split(':').nth(1)?;
    let mut parts = counters.split(',');
    let rx = parts.next()?.trim().parse().ok()?;
    let tx = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((rx, tx))
}

/// Returns the `{...}` range of the line, braces included.
fn extract_braced(line: &str) -> Option<String> {
    let open = line.find('{')?;
    let close = line.find('}')?;
    (open < close).then(|| line[open..=close].to_string())
}
