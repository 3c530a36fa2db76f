//! Bounded producer/consumer ingress queue, §3.
//!
//! Two halves — *fill* (source → consumer) and *empty* (consumer → source) —
//! together hold exactly `POOL_COUNT` buffer ids at all times: every buffer
//! is in exactly one half. Capacity equals the pool size, so the queue can
//! never itself overflow; a source thread that finds the empty half drained
//! simply blocks (backpressure).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Half {
    ids: Mutex<VecDeque<usize>>,
    cv: Condvar,
}

impl Half {
    fn new() -> Self {
        Self {
            ids: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, id: usize) {
        self.ids.lock().push_back(id);
        self.cv.notify_one();
    }

    fn pop_wait(&self, timeout: Duration, exit: &AtomicBool) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.ids.lock();
        loop {
            if let Some(id) = guard.pop_front() {
                return Some(id);
            }
            if exit.load(Ordering::Acquire) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline - now;
            let result = self.cv.wait_for(&mut guard, remaining);
            if result.timed_out() {
                return None;
            }
        }
    }
}

/// The SPSC-per-direction ingress queue. Capacity is implicitly `POOL_COUNT`
/// because that many ids are seeded into the empty half at construction and
/// ids never leak or duplicate between halves.
pub struct IngressQueue {
    fill: Half,
    empty: Half,
    exit_requested: AtomicBool,
}

impl IngressQueue {
    /// Seed every buffer id `0..pool_count` into the empty half.
    pub fn new(pool_count: usize) -> Self {
        let empty = Half::new();
        {
            let mut guard = empty.ids.lock();
            guard.extend(0..pool_count);
        }
        Self {
            fill: Half::new(),
            empty,
            exit_requested: AtomicBool::new(false),
        }
    }

    /// Source side: take an empty buffer id to fill, blocking up to `timeout`.
    pub fn acquire_empty(&self, timeout: Duration) -> Option<usize> {
        self.empty.pop_wait(timeout, &self.exit_requested)
    }

    /// Source side: hand a filled buffer id to the consumer.
    pub fn push_filled(&self, id: usize) {
        self.fill.push(id);
    }

    /// Consumer side: take a filled buffer id, blocking up to `timeout`
    /// (§4.6: the consumer loop uses a 1-second timeout).
    pub fn pop_filled(&self, timeout: Duration) -> Option<usize> {
        self.fill.pop_wait(timeout, &self.exit_requested)
    }

    /// Consumer side: release a drained buffer id back to the source.
    pub fn release_empty(&self, id: usize) {
        self.empty.push(id);
    }

    /// Wake every blocked waiter so threads can observe shutdown promptly.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
        self.fill.cv.notify_all();
        self.empty.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_id_starts_in_the_empty_half() {
        let q = IngressQueue::new(4);
        let mut seen = Vec::new();
        while let Some(id) = q.acquire_empty(Duration::from_millis(1)) {
            seen.push(id);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn filled_buffer_round_trips_to_empty() {
        let q = IngressQueue::new(1);
        let id = q.acquire_empty(Duration::from_millis(10)).unwrap();
        q.push_filled(id);
        let popped = q.pop_filled(Duration::from_millis(10)).unwrap();
        assert_eq!(popped, id);
        q.release_empty(popped);
        let reacquired = q.acquire_empty(Duration::from_millis(10)).unwrap();
        assert_eq!(reacquired, id);
    }

    #[test]
    fn empty_fill_half_times_out_without_blocking_forever() {
        let q = IngressQueue::new(0);
        assert!(q.pop_filled(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn request_exit_unblocks_waiters() {
        let q = std::sync::Arc::new(IngressQueue::new(0));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pop_filled(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        q.request_exit();
        assert!(handle.join().unwrap().is_none());
    }
}
