//! # OpenVPN supervisor
//!
//! This library launches an external openvpn process, attaches to its
//! text-line management socket on loopback, drives the configuration
//! conversation (notifications, credentials, hold release) and translates
//! the notification streams into a small set of lifecycle events. It also
//! enforces a bounded disconnect: a graceful shutdown request through the
//! management channel, backed by a forced kill if the child overstays its
//! deadline.

pub mod error;
pub mod event;
pub mod helper;
pub mod launcher;
pub mod logger;
pub mod management;
pub mod port;
pub mod protocol;
pub mod proxy;
pub mod session;
mod worker;

// Re-export commonly used items
pub use error::{ErrorCategory, StartError, TunnelError};
pub use event::TunnelEvent;
pub use helper::{CmdId, CmdStatus, OsHelper, ProcessHelper};
pub use launcher::{locate_openvpn, ChildHandle, LaunchSpec};
pub use logger::init_logger;
pub use proxy::ProxySettings;
pub use session::{
    ConnectRequest, ConnectionStatus, OpenVpnSession, SessionConfig, Tunables,
};
