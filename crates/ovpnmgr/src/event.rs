use crate::error::TunnelError;

/// Lifecycle events delivered to the caller on the channel registered with
/// [`OpenVpnSession::set_events_tx`](crate::OpenVpnSession::set_events_tx).
///
/// All events originate on the session worker, except for the `Disconnected`
/// that `start_disconnect` emits synchronously when no session is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The tunnel is up.
    Connected,
    /// The child is renegotiating; the tunnel is temporarily down.
    Reconnecting,
    /// The session ended. Emitted exactly once per session.
    Disconnected,
    /// A classified error. The session may or may not continue, see
    /// [`TunnelError`].
    Error(TunnelError),
    /// The server asked for a username and none was supplied; answer with
    /// `continue_with_username_and_password`.
    RequestUsername,
    /// The server asked for a password and none was supplied; answer with
    /// `continue_with_password`.
    RequestPassword,
    /// Periodic byte counters. The first sample per session carries the
    /// absolute counters, subsequent samples carry deltas. `total` is
    /// reserved for cumulative reporting and is always `false` here.
    Statistics { rx: u64, tx: u64, total: bool },
}
