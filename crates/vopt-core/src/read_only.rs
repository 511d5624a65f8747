//! Read-only mode entry and notification.
//!
//! Any thread may request read-only entry by compare-and-swapping the
//! shared error word from success to its error code; the winner moves the
//! notifier from `may-notify` to `notifying` and the admin thread walks the
//! per-thread listener lists, each listener called exactly once per entry.
//! Every thread keeps its own lagging `is_read_only` bit so queries need no
//! synchronization; a transiently stale bit can admit one extra journal
//! write, which the journal thread discards when it re-checks the
//! authoritative word.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use tracing::{error, info};

const SUCCESS: i32 = 0;

const STATE_MAY_NOTIFY: u8 = 0;
const STATE_NOTIFYING: u8 = 1;
const STATE_MAY_NOT_NOTIFY: u8 = 2;
const STATE_NOTIFICATION_PENDING: u8 = 3;

/// A listener invoked (on the admin thread) when the device goes
/// read-only. Registered per thread.
pub type ReadOnlyListener = Box<dyn FnMut() + Send>;

/// The process-wide read-only error and state words, plus per-thread
/// listener lists and cached bits.
pub struct ReadOnlyNotifier {
    error: AtomicI32,
    state: AtomicU8,
    listeners: Vec<Vec<ReadOnlyListener>>,
    /// Per-thread lagging cache of "is read only".
    cached: Vec<bool>,
}

impl ReadOnlyNotifier {
    #[must_use]
    pub fn new(thread_count: usize) -> Self {
        Self {
            error: AtomicI32::new(SUCCESS),
            state: AtomicU8::new(STATE_MAY_NOTIFY),
            listeners: (0..thread_count).map(|_| Vec::new()).collect(),
            cached: vec![false; thread_count],
        }
    }

    /// Register a listener to run on behalf of `thread` at read-only entry.
    pub fn register_listener(&mut self, thread: usize, listener: ReadOnlyListener) {
        self.listeners[thread].push(listener);
    }

    /// The lagging per-thread query. May briefly disagree with the
    /// authoritative word.
    #[must_use]
    pub fn is_read_only(&self, thread: usize) -> bool {
        self.cached[thread]
    }

    /// The authoritative check; the journal thread re-checks this before
    /// issuing a write admitted under a stale cache.
    #[must_use]
    pub fn is_read_only_authoritative(&self) -> bool {
        self.error.load(Ordering::Acquire) != SUCCESS
    }

    #[must_use]
    pub fn read_only_error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    /// Request read-only entry with `error_code` (nonzero). The first
    /// caller wins; later calls are no-ops. Returns whether this call won.
    pub fn enter_read_only(&mut self, error_code: i32) -> bool {
        debug_assert_ne!(error_code, SUCCESS);
        let won = self
            .error
            .compare_exchange(SUCCESS, error_code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            return false;
        }
        error!(target: "vopt::read_only", event = "entering_read_only", error_code);
        match self.state.compare_exchange(
            STATE_MAY_NOTIFY,
            STATE_NOTIFYING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => self.notify_all(),
            Err(_) => {
                // Notifications are currently suppressed; remember one.
                self.state.store(STATE_NOTIFICATION_PENDING, Ordering::Release);
            }
        }
        true
    }

    fn notify_all(&mut self) {
        for (thread, listeners) in self.listeners.iter_mut().enumerate() {
            self.cached[thread] = true;
            for listener in listeners.iter_mut() {
                listener();
            }
        }
        self.state.store(STATE_MAY_NOTIFY, Ordering::Release);
        info!(target: "vopt::read_only", event = "read_only_entered");
    }

    /// Suppress notifications (during suspend phases that must not race a
    /// listener walk).
    pub fn disallow_notifications(&mut self) {
        let _ = self.state.compare_exchange(
            STATE_MAY_NOTIFY,
            STATE_MAY_NOT_NOTIFY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Re-allow notifications, delivering one deferred while suppressed.
    pub fn allow_notifications(&mut self) {
        let pending = self
            .state
            .compare_exchange(
                STATE_NOTIFICATION_PENDING,
                STATE_NOTIFYING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if pending {
            self.notify_all();
        } else {
            self.state.store(STATE_MAY_NOTIFY, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn first_entry_wins_and_notifies_each_listener_once() {
        let mut notifier = ReadOnlyNotifier::new(2);
        let count = Arc::new(AtomicU32::new(0));
        for thread in 0..2 {
            let count = count.clone();
            notifier.register_listener(
                thread,
                Box::new(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        assert!(notifier.enter_read_only(-5));
        assert!(!notifier.enter_read_only(-7), "second entry loses");
        assert_eq!(count.load(Ordering::Relaxed), 2, "one call per listener");
        assert_eq!(notifier.read_only_error(), -5);
        assert!(notifier.is_read_only(0));
        assert!(notifier.is_read_only(1));
        assert!(notifier.is_read_only_authoritative());
    }

    #[test]
    fn deferred_notification_fires_when_reallowed() {
        let mut notifier = ReadOnlyNotifier::new(1);
        let count = Arc::new(AtomicU32::new(0));
        let listener_count = count.clone();
        notifier.register_listener(
            0,
            Box::new(move || {
                listener_count.fetch_add(1, Ordering::Relaxed);
            }),
        );
        notifier.disallow_notifications();
        assert!(notifier.enter_read_only(-9));
        assert_eq!(count.load(Ordering::Relaxed), 0, "suppressed");
        // The authoritative word is already set even though the caches lag.
        assert!(notifier.is_read_only_authoritative());
        assert!(!notifier.is_read_only(0), "cache lags until notification");
        notifier.allow_notifications();
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(notifier.is_read_only(0));
    }

    #[test]
    fn clean_device_reads_false_everywhere() {
        let notifier = ReadOnlyNotifier::new(3);
        assert!(!notifier.is_read_only_authoritative());
        assert!(!notifier.is_read_only(2));
        assert_eq!(notifier.read_only_error(), 0);
    }
}
