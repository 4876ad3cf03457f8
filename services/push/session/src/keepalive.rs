//! Keep-alive timing for broker connections.
//!
//! The client sends a single PINGREQ after starting. Periodic liveness comes
//! from the keep-alive negotiated in CONNECT, with the background host waking
//! the process before the hand-off window runs out.

use push_wire::Packet;
use std::time::Duration;

/// Keep-alive interval negotiated in CONNECT
pub const KEEP_ALIVE_SECS: u16 = 900;

/// Safety margin subtracted from the keep-alive when handing off a socket
pub const HANDOFF_MARGIN: Duration = Duration::from_secs(60);

/// Time a resumed connection stays in the foreground before handing back
pub const WAIT_TIME: Duration = Duration::from_secs(5);

/// Window the background host keeps a transferred socket alive for
pub fn handoff_window(keep_alive_secs: u16) -> Duration {
    Duration::from_secs(u64::from(keep_alive_secs)).saturating_sub(HANDOFF_MARGIN)
}

/// Grace delay between registration completing and the socket hand-off
pub fn transfer_grace(wait_time: Duration) -> Duration {
    wait_time + Duration::from_secs(1)
}

/// Build a PINGREQ frame
pub fn build_ping() -> Packet {
    Packet::PingReq
}
