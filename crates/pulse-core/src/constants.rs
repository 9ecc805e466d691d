//! Compiled protocol constants and timing defaults.

/// Protocol revision this client is compiled against.
///
/// An inbound envelope carrying a different nonzero server revision
/// disables the client (see the orchestrator's revision gate).
pub const REVISION: u32 = 19;

/// How long a cached session continuation stays usable, in seconds.
///
/// Short on purpose: resume data is only meant to survive a process
/// or page reload, not an overnight gap.
pub const SESSION_TTL_SECS: u64 = 60;

/// TTL for shared coordination flags (blocked transports), in seconds.
///
/// A stale "blocked" marking self-heals after this window even if no
/// instance clears it explicitly.
pub const SHARED_FLAG_TTL_SECS: u64 = 24 * 60 * 60;

/// Delay before an `Offline` status transition is surfaced, to absorb
/// flapping during quick reconnects, in milliseconds.
pub const OFFLINE_DELAY_MS: u64 = 5_000;

/// Default interval between server keepalive pings, in seconds.
/// A connection with no ping for twice this interval is stuck.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Client-side long-poll request timeout, in seconds.
/// Kept below the common 100 s server idle window.
pub const LONG_POLL_TIMEOUT_SECS: u64 = 40;

/// Cooldown before a silent socket retry while running on long-poll,
/// in seconds.
pub const SOCKET_RETRY_COOLDOWN_SECS: u64 = 120;

/// Delay for a light `reconnect` (redial with existing config), in
/// seconds.
pub const RECONNECT_DELAY_SECS: u64 = 3;

/// Delay before reconnecting after a server-restarting notice, in
/// seconds. Longer than a plain reconnect so a restarting server is
/// not stampeded.
pub const SERVER_RESTART_DELAY_SECS: u64 = 30;

/// Interval between cached-config validity checks, in seconds.
pub const CONFIG_CHECK_INTERVAL_SECS: u64 = 60;

/// Interval between watch-tag renewal calls, in seconds.
pub const WATCH_RENEW_INTERVAL_SECS: u64 = 300;

/// Bound on the recent-message-id dedup buffer.
pub const RECENT_MIDS_BOUND: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_is_nonzero() {
        assert!(REVISION > 0);
    }

    #[test]
    fn long_poll_timeout_below_server_idle_window() {
        assert!(LONG_POLL_TIMEOUT_SECS < 100);
    }

    #[test]
    fn server_restart_delay_exceeds_reconnect_delay() {
        assert!(SERVER_RESTART_DELAY_SECS > RECONNECT_DELAY_SECS);
    }
}
