//! Application-wide constants for the channel subsystem.
//!
//! Centralizes the magic numbers that drive negotiation timeouts, heartbeat
//! cadence, and buffer auditing so they are documented and discoverable in
//! one place rather than scattered through `channel/`.

use std::time::Duration;

// ============================================================================
// Signalling
// ============================================================================

/// End-to-end budget from `Connecting` to a completed `Signalling` handshake.
pub const SIGNALLING_TIMEOUT: Duration = Duration::from_secs(10);

/// Sub-budget given to the signalling transport's own `connect()` call.
pub const SIGNALLING_CONNECT_BUDGET: Duration = Duration::from_secs(5);

// ============================================================================
// Command drain (close / dispose)
// ============================================================================

/// Maximum time to wait for the command-channel buffer to drain on close/dispose.
pub const COMMAND_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll interval while waiting for command-channel drain.
pub const COMMAND_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Heartbeat
// ============================================================================

/// Default interval between heartbeat pings while stable.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default time allowed for a pending heartbeat to receive its `Pong`.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(1000);

// ============================================================================
// Buffer audit
// ============================================================================

/// How often the channel re-audits its transports for stalls.
pub const AUDIT_INTERVAL: Duration = Duration::from_millis(200);

/// Default `BufferAuditor` commitment lifetime.
pub const AUDITOR_MAX_BUFFER_TIME: Duration = Duration::from_millis(500);

/// Default `BufferAuditor` background sweep interval.
pub const AUDITOR_CLEAN_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// CLI
// ============================================================================

/// Refresh period for `meshctl stream`'s live table.
pub const STREAM_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Latency above which `list`/`stream` colour a channel's latency as high.
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(250);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signalling_budgets_are_consistent() {
        assert_eq!(SIGNALLING_CONNECT_BUDGET, Duration::from_secs(5));
        assert!(SIGNALLING_CONNECT_BUDGET < SIGNALLING_TIMEOUT);
    }

    #[test]
    fn test_heartbeat_values_are_reasonable() {
        assert!(HEARTBEAT_INTERVAL >= Duration::from_millis(100));
        assert!(HEARTBEAT_TIMEOUT >= Duration::from_millis(100));
    }

    #[test]
    fn test_command_drain_timeout_is_multiple_of_poll_interval() {
        assert_eq!(
            COMMAND_DRAIN_TIMEOUT.as_millis() % COMMAND_DRAIN_POLL_INTERVAL.as_millis(),
            0
        );
    }
}
