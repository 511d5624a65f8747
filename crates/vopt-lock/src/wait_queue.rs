//! FIFO of suspended operations.
//!
//! A wait queue is owned by exactly one zone and is never shared between
//! threads; all operations take `&mut self`. Each waiter carries its payload
//! and, optionally, a callback to run when it is notified. Notifying invokes
//! the waiter's own callback when present, else the supplied one.

use std::collections::VecDeque;

/// Callback invoked with the waiter's payload on notification.
pub type WaiterCallback<T> = Box<dyn FnOnce(T) + Send>;

/// One suspended operation.
pub struct Waiter<T> {
    pub item: T,
    callback: Option<WaiterCallback<T>>,
}

impl<T> Waiter<T> {
    /// Run this waiter: its own callback if it has one, else `default`.
    pub fn fire(self, default: &mut dyn FnMut(T)) {
        match self.callback {
            Some(callback) => callback(self.item),
            None => default(self.item),
        }
    }

    /// Take the payload, discarding any callback.
    pub fn into_item(self) -> T {
        self.item
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("item", &self.item)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// A FIFO of waiters with constant-time enqueue and dequeue.
pub struct WaitQueue<T> {
    queue: VecDeque<Waiter<T>>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, item: T) {
        self.queue.push_back(Waiter {
            item,
            callback: None,
        });
    }

    /// Enqueue with a callback that supersedes the notifier's default.
    pub fn enqueue_with(&mut self, item: T, callback: WaiterCallback<T>) {
        self.queue.push_back(Waiter {
            item,
            callback: Some(callback),
        });
    }

    pub fn dequeue_next(&mut self) -> Option<Waiter<T>> {
        self.queue.pop_front()
    }

    /// Notify the oldest waiter, if any. Returns whether one was notified.
    pub fn notify_next(&mut self, default: &mut dyn FnMut(T)) -> bool {
        match self.queue.pop_front() {
            Some(waiter) => {
                waiter.fire(default);
                true
            }
            None => false,
        }
    }

    /// Notify every waiter in FIFO order. Waiters enqueued by the callbacks
    /// themselves are serviced too.
    pub fn notify_all(&mut self, default: &mut dyn FnMut(T)) -> usize {
        let mut notified = 0;
        while self.notify_next(default) {
            notified += 1;
        }
        notified
    }

    /// Move every waiter from `self` onto the back of `to`, preserving order.
    pub fn transfer_all(&mut self, to: &mut Self) {
        to.queue.append(&mut self.queue);
    }

    /// Remove and return the waiters whose payload matches `predicate`,
    /// preserving the relative order of both the kept and returned sets.
    pub fn dequeue_matching(&mut self, predicate: impl Fn(&T) -> bool) -> Vec<Waiter<T>> {
        let mut matched = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for waiter in self.queue.drain(..) {
            if predicate(&waiter.item) {
                matched.push(waiter);
            } else {
                kept.push_back(waiter);
            }
        }
        self.queue = kept;
        matched
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn has_waiters(&self) -> bool {
        !self.queue.is_empty()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for WaitQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("count", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut queue = WaitQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.count(), 3);
        assert_eq!(queue.dequeue_next().map(Waiter::into_item), Some(1));
        assert_eq!(queue.dequeue_next().map(Waiter::into_item), Some(2));
        assert_eq!(queue.dequeue_next().map(Waiter::into_item), Some(3));
        assert!(!queue.has_waiters());
    }

    #[test]
    fn notify_prefers_waiter_callback() {
        let mut queue = WaitQueue::new();
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits_in_cb = hits.clone();
        queue.enqueue_with(
            10,
            Box::new(move |item| {
                hits_in_cb.fetch_add(item, std::sync::atomic::Ordering::Relaxed);
            }),
        );
        queue.enqueue(5);
        let mut default_sum = 0;
        queue.notify_all(&mut |item| default_sum += item);
        assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 10);
        assert_eq!(default_sum, 5);
    }

    #[test]
    fn transfer_preserves_order() {
        let mut from = WaitQueue::new();
        let mut to = WaitQueue::new();
        to.enqueue(1);
        from.enqueue(2);
        from.enqueue(3);
        from.transfer_all(&mut to);
        assert_eq!(from.count(), 0);
        let drained: Vec<_> = std::iter::from_fn(|| to.dequeue_next().map(Waiter::into_item))
            .collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn dequeue_matching_splits_stably() {
        let mut queue = WaitQueue::new();
        for i in 0..6 {
            queue.enqueue(i);
        }
        let even: Vec<_> = queue
            .dequeue_matching(|item| item % 2 == 0)
            .into_iter()
            .map(Waiter::into_item)
            .collect();
        assert_eq!(even, vec![0, 2, 4]);
        let rest: Vec<_> = std::iter::from_fn(|| queue.dequeue_next().map(Waiter::into_item))
            .collect();
        assert_eq!(rest, vec![1, 3, 5]);
    }
}
