//! Shared constants between host and spawner helper
//!
//! These constants must be identical on both sides of the host-spawner
//! boundary.

/// Fd hand-off handshake constants.
pub mod handshake {
    use std::time::Duration;

    /// How long the host waits for the spawner to connect and send the fds.
    pub const TIMEOUT: Duration = Duration::from_secs(2);

    /// Random bytes in a socket file name (url-safe encoded).
    pub const SOCKET_NAME_BYTES: usize = 16;

    /// Exactly this many fds cross the socket: stdin-write, stdout-read.
    pub const FD_COUNT: usize = 2;

    /// Payload bytes accompanying the rights message: one native-endian u32
    /// positional marker per fd.
    pub const PAYLOAD_LEN: usize = FD_COUNT * 4;
}

/// Pipe I/O constants.
pub mod io {
    /// Upper bound for a single unbuffered read.
    pub const UNBUFFERED_READ_MAX: usize = 64 * 1024;
}

/// Cleanup watcher constants.
pub mod watcher {
    use std::time::Duration;

    /// Grace period between SIGTERM and SIGKILL escalation.
    pub const TERM_GRACE: Duration = Duration::from_secs(3);

    /// Poll interval while waiting for the pid to disappear.
    pub const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);
}
