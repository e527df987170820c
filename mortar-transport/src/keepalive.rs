//! TCP keep-alive configuration.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Socket keep-alive settings applied to every connection.
///
/// Keep-alive is enabled only when both durations are non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Idle time before the first keep-alive probe.
    pub keep_alive_time: Duration,

    /// Time between unanswered keep-alive probes.
    pub keep_alive_interval: Duration,
}

impl TimeoutConfig {
    /// Create a keep-alive configuration.
    #[must_use]
    pub fn new(keep_alive_time: Duration, keep_alive_interval: Duration) -> Self {
        Self {
            keep_alive_time,
            keep_alive_interval,
        }
    }

    /// Configuration with keep-alive turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether socket keep-alive will be configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.keep_alive_time.is_zero() && !self.keep_alive_interval.is_zero()
    }
}

/// Apply keep-alive settings to a connected socket.
///
/// Returns whether keep-alive was configured. A platform rejecting the
/// settings is logged and otherwise ignored; dead peers are then only
/// noticed when a read or write fails.
pub fn configure_keep_alive(stream: &TcpStream, config: &TimeoutConfig) -> bool {
    if !config.is_enabled() {
        return false;
    }

    let keepalive = TcpKeepalive::new().with_time(config.keep_alive_time);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows",
        target_os = "freebsd",
        target_os = "netbsd",
    ))]
    let keepalive = keepalive.with_interval(config.keep_alive_interval);

    match SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        Ok(()) => {
            tracing::debug!(
                time = ?config.keep_alive_time,
                interval = ?config.keep_alive_interval,
                "tcp keep-alive configured"
            );
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "socket keep-alive could not be configured");
            false
        }
    }
}
