//! Free-port probing for the management channel.

use std::net::{Ipv4Addr, TcpListener};

/// How many ports above the base are probed before giving up.
const PROBE_RANGE: u16 = 64;

/// Returns the lowest loopback TCP port >= `base` that can currently be
/// bound, or `None` if the whole probe range is taken.
///
/// The port is released again before returning; the child binds it shortly
/// after, so a racing process can still steal it. The dial-retry budget in
/// the session worker absorbs that case.
pub fn pick_port(base: u16) -> Option<u16> {
    (0..PROBE_RANGE)
        .filter_map(|offset| base.checked_add(offset))
        .find(|&port| TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok())
}
