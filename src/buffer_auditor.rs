//! BufferAuditor tracks outbound byte commitments with expirations and
//! decides whether a transport's buffered amount is still accounted for,
//! or has stalled.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

struct Entry {
    bytes: usize,
    expires_at: Instant,
}

/// Tracks recent `record(bytes)` commitments and audits a transport's
/// reported buffered amount against them.
pub struct BufferAuditor {
    queue: Mutex<VecDeque<Entry>>,
    max_buffer_time: Duration,
    clean_interval: Duration,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for BufferAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAuditor").finish_non_exhaustive()
    }
}

impl BufferAuditor {
    /// Build an auditor with the given commitment lifetime and sweep period.
    #[must_use]
    pub fn new(max_buffer_time: Duration, clean_interval: Duration) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self { queue: Mutex::new(VecDeque::new()), max_buffer_time, clean_interval, cancel_tx, cancel_rx }
    }

    /// Build an auditor using the default tunables.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(crate::constants::AUDITOR_MAX_BUFFER_TIME, crate::constants::AUDITOR_CLEAN_INTERVAL)
    }

    /// Record a commitment to send `bytes`, expiring after `max_buffer_time`.
    pub fn record(&self, bytes: usize) {
        let expires_at = Instant::now() + self.max_buffer_time;
        let mut queue = self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.push_back(Entry { bytes, expires_at });
    }

    /// Step 1-3: drop expired head entries, then sum what remains.
    fn allowed(&self) -> usize {
        let now = Instant::now();
        let mut queue = self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while matches!(queue.front(), Some(entry) if entry.expires_at <= now) {
            queue.pop_front();
        }
        queue.iter().map(|e| e.bytes).sum()
    }

    /// `true` if `current_buffered_bytes` is still accounted for by recent
    /// commitments; `false` means the transport is considered stalled. Never
    /// panics — internal inconsistency is treated as "stalled".
    #[must_use]
    pub fn audit(&self, current_buffered_bytes: usize) -> bool {
        current_buffered_bytes <= self.allowed()
    }

    /// Spawn the background sweep task. The returned handle should be
    /// aborted (or `cancel()` called) to stop it; it otherwise never exits.
    pub fn spawn_cleanup(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let auditor = std::sync::Arc::clone(self);
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(auditor.clean_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = auditor.allowed();
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Signal the cleanup task to stop.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_accounts_for_recorded_bytes() {
        let auditor = BufferAuditor::new(Duration::from_millis(500), Duration::from_millis(50));
        auditor.record(100);
        assert!(auditor.audit(100));
        assert!(!auditor.audit(101));
    }

    #[test]
    fn test_expired_entries_drop_out_of_allowed() {
        let auditor = BufferAuditor::new(Duration::from_millis(10), Duration::from_millis(5));
        auditor.record(100);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!auditor.audit(1));
    }

    #[test]
    fn test_monotone_in_expirations() {
        let auditor = BufferAuditor::new(Duration::from_millis(10), Duration::from_millis(5));
        auditor.record(50);
        let allowed_before = auditor.allowed();
        std::thread::sleep(Duration::from_millis(30));
        let allowed_after = auditor.allowed();
        assert!(allowed_after <= allowed_before);
    }

    #[test]
    fn test_empty_queue_allows_nothing() {
        let auditor = BufferAuditor::with_defaults();
        assert!(auditor.audit(0));
        assert!(!auditor.audit(1));
    }
}
