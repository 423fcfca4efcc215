/// High-level grouping of tunnel errors for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The openvpn process could not be started or reached.
    Startup,
    /// Credential verification failed.
    Authentication,
    /// The tunnel came up degraded or the transport is failing.
    Tunnel,
    /// The virtual network adapter is missing or busy.
    Adapter,
}

/// Errors surfaced to the caller as `TunnelEvent::Error` while a session runs.
///
/// Startup errors terminate the session; the remaining kinds are reported and
/// the supervisor keeps driving the conversation until the child closes the
/// management socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelError {
    /// The openvpn binary could not be located or repeatedly failed to start.
    CantRunOpenVpn,
    /// The management socket never opened within the startup budget.
    NoManagementSocket,
    /// The server rejected the supplied username/password.
    AuthFailure,
    /// The child reported `CONNECTED,ERROR` for the established tunnel.
    ConnectedWithErrors,
    /// UDP transport cannot assign or route its local endpoint.
    UdpCantAssign,
    /// UDP transport ran out of socket buffer space.
    UdpNoBufferSpace,
    /// UDP transport reports the network as down.
    UdpNetworkDown,
    /// TCP transport failure reported by the child.
    TcpFailed,
    /// The child finished initialization but flagged errors.
    InitSequenceErrors,
    /// No TUN/TAP adapters are installed on this system.
    NoTunTapAdapters,
    /// Every TAP adapter on this system is already in use.
    AllTapAdaptersInUse,
}

impl TunnelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::CantRunOpenVpn | TunnelError::NoManagementSocket => {
                ErrorCategory::Startup
            }
            TunnelError::AuthFailure => ErrorCategory::Authentication,
            TunnelError::ConnectedWithErrors
            | TunnelError::UdpCantAssign
            | TunnelError::UdpNoBufferSpace
            | TunnelError::UdpNetworkDown
            | TunnelError::TcpFailed
            | TunnelError::InitSequenceErrors => ErrorCategory::Tunnel,
            TunnelError::NoTunTapAdapters | TunnelError::AllTapAdaptersInUse => {
                ErrorCategory::Adapter
            }
        }
    }

    /// Returns the user-facing error message.
    pub fn user_message(&self) -> &'static str {
        match self {
            TunnelError::CantRunOpenVpn => "Could not start the openvpn process.",
            TunnelError::NoManagementSocket => {
                "The openvpn management socket did not open in time."
            }
            TunnelError::AuthFailure => "VPN username or password was rejected.",
            TunnelError::ConnectedWithErrors => "Tunnel established, but with errors.",
            TunnelError::UdpCantAssign => "UDP endpoint could not be assigned or routed.",
            TunnelError::UdpNoBufferSpace => "UDP socket ran out of buffer space.",
            TunnelError::UdpNetworkDown => "The network is down.",
            TunnelError::TcpFailed => "TCP transport to the server failed.",
            TunnelError::InitSequenceErrors => {
                "Initialization sequence completed with errors."
            }
            TunnelError::NoTunTapAdapters => "No TUN/TAP adapters are installed.",
            TunnelError::AllTapAdaptersInUse => "All TAP adapters are currently in use.",
        }
    }
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for TunnelError {}

/// Precondition violations reported by `OpenVpnSession::start_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// A session is already live; only one session per instance is allowed.
    SessionActive,
    /// Proxy auto-detection must be resolved by the caller before connecting.
    ProxyAutodetect,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::SessionActive => write!(f, "a session is already active"),
            StartError::ProxyAutodetect => {
                write!(f, "proxy mode 'autodetect' must be resolved before connecting")
            }
        }
    }
}

impl std::error::Error for StartError {}
