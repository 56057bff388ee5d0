//! CancellableDelay: a scoped one-shot timer with silent/loud cancellation. `start()` spawns a
//! task that either fires `on_timeout` after `duration`, or observes
//! cancellation first and optionally fires `on_cancellation`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One-shot, cancellable delay.
pub struct CancellableDelay {
    duration: Duration,
    started: AtomicBool,
    expired: AtomicBool,
    cancelled: AtomicBool,
    cancel_tx: watch::Sender<Option<bool>>,
    cancel_rx: watch::Receiver<Option<bool>>,
}

impl std::fmt::Debug for CancellableDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableDelay")
            .field("duration", &self.duration)
            .field("is_started", &self.is_started())
            .field("is_expired", &self.is_expired())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellableDelay {
    /// Build a delay for `duration`, not yet started.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(None);
        Self {
            duration,
            started: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        }
    }

    /// `true` once `start()` has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// `true` once the delay has elapsed without cancellation.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// `true` once `cancel()` has been called (silently or not).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Start the timer. Idempotent-fail: a second call on an
    /// already-started delay is a no-op and returns `false`.
    ///
    /// `on_timeout` fires exactly once if the delay elapses uncancelled.
    /// `on_cancellation` fires exactly once if `cancel(false)` preempts it;
    /// it never fires for `cancel(true)` (silent cancellation).
    pub fn start<FT, FC>(self: &Arc<Self>, on_timeout: FT, on_cancellation: FC) -> bool
    where
        FT: FnOnce() + Send + 'static,
        FC: FnOnce() + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let delay = Arc::clone(self);
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay.duration) => {
                    delay.expired.store(true, Ordering::SeqCst);
                    on_timeout();
                }
                res = cancel_rx.changed() => {
                    if res.is_ok() {
                        if let Some(silent) = *cancel_rx.borrow() {
                            if !silent {
                                on_cancellation();
                            }
                        }
                    }
                }
            }
        });
        true
    }

    /// Cancel the delay. `silent = true` suppresses `on_cancellation` — used
    /// when the caller already holds a lock and cannot safely re-enter an
    /// event callback.
    pub fn cancel(&self, silent: bool) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(Some(silent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_fires_timeout_when_uncancelled() {
        let delay = Arc::new(CancellableDelay::new(Duration::from_millis(10)));
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        delay.start(move || { fired2.fetch_add(1, Ordering::SeqCst); }, || {});

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(delay.is_expired());
        assert!(!delay.is_cancelled());
    }

    #[tokio::test]
    async fn test_loud_cancellation_fires_on_cancellation_not_timeout() {
        let delay = Arc::new(CancellableDelay::new(Duration::from_millis(50)));
        let timed_out = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (t2, c2) = (Arc::clone(&timed_out), Arc::clone(&cancelled));
        delay.start(move || timed_out.store(true, Ordering::SeqCst), move || cancelled.store(true, Ordering::SeqCst));

        delay.cancel(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(c2.load(Ordering::SeqCst));
        assert!(!t2.load(Ordering::SeqCst));
        assert!(!delay.is_expired());
    }

    #[tokio::test]
    async fn test_silent_cancellation_suppresses_callback() {
        let delay = Arc::new(CancellableDelay::new(Duration::from_millis(50)));
        let cancelled = Arc::new(AtomicBool::new(false));
        let c2 = Arc::clone(&cancelled);
        delay.start(|| {}, move || c2.store(true, Ordering::SeqCst));

        delay.cancel(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!cancelled.load(Ordering::SeqCst));
        assert!(delay.is_cancelled());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_fail() {
        let delay = Arc::new(CancellableDelay::new(Duration::from_millis(10)));
        assert!(delay.start(|| {}, || {}));
        assert!(!delay.start(|| {}, || {}));
    }
}
