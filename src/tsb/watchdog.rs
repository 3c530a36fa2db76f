//! Pause watchdog and pause-time monitor, §4.4.
//!
//! Pausing stops delivery but not the live producer; the watchdog fires a
//! callback `PAUSE_POST_READ_MS` after the last successful read so a paused
//! player that never resumes doesn't silently fall off the back of the
//! buffer once the live edge catches up with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::PAUSE_POST_READ_MS;

enum Command {
    Restart,
    Stop,
    Shutdown,
}

struct Shared {
    queue: Mutex<Vec<Command>>,
    cv: Condvar,
}

/// Fires `on_expire(expired)` once per `start`/`restart` cycle: `true` if
/// `PAUSE_POST_READ_MS` elapsed with no intervening restart or stop, `false`
/// if `stop` cancelled it first.
pub struct PauseWatchdog {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PauseWatchdog {
    pub fn start<F>(on_expire: F) -> Self
    where
        F: Fn(bool) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let handle = std::thread::spawn(move || Self::run(worker_shared, on_expire));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    fn run<F>(shared: Arc<Shared>, on_expire: F)
    where
        F: Fn(bool),
    {
        let timeout = Duration::from_millis(PAUSE_POST_READ_MS);
        'idle: loop {
            let mut guard = shared.queue.lock();
            loop {
                match guard.pop() {
                    Some(Command::Shutdown) => return,
                    Some(Command::Stop) => continue,
                    Some(Command::Restart) => break,
                    None => {
                        shared.cv.wait(&mut guard);
                        continue;
                    }
                }
            }
            drop(guard);

            // Armed: wait for timeout, watching for an interrupting command.
            let mut deadline = Instant::now() + timeout;
            loop {
                let mut guard = shared.queue.lock();
                let now = Instant::now();
                if now >= deadline {
                    drop(guard);
                    on_expire(true);
                    continue 'idle;
                }
                let wait = shared.cv.wait_for(&mut guard, deadline - now);
                if wait.timed_out() {
                    drop(guard);
                    on_expire(true);
                    continue 'idle;
                }
                match guard.pop() {
                    Some(Command::Shutdown) => return,
                    Some(Command::Stop) => {
                        drop(guard);
                        on_expire(false);
                        continue 'idle;
                    }
                    Some(Command::Restart) => {
                        deadline = Instant::now() + timeout;
                        continue;
                    }
                    None => continue,
                }
            }
        }
    }

    fn send(&self, cmd: Command) {
        self.shared.queue.lock().push(cmd);
        self.shared.cv.notify_all();
    }

    /// Idempotent: arms (or re-arms) the timer.
    pub fn restart(&self) {
        self.send(Command::Restart);
    }

    /// Idempotent: cancels a pending expiry with `on_expire(false)`.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }
}

impl Drop for PauseWatchdog {
    fn drop(&mut self) {
        self.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Accumulates wall-clock time spent paused, for stats and the "actual"
/// field of `seek0` (§6).
pub struct PauseTimeMonitor {
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    accumulated: Mutex<Duration>,
}

impl PauseTimeMonitor {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            accumulated: Mutex::new(Duration::ZERO),
        }
    }

    /// Begin (or continue) accumulating; a second call while already
    /// running is a no-op.
    pub fn update_time_interval(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.started_at.lock() = Some(Instant::now());
        }
    }

    /// Stop accumulating and fold the open interval into the total.
    pub fn stop_time_interval(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(start) = self.started_at.lock().take() {
                *self.accumulated.lock() += start.elapsed();
            }
        }
    }

    pub fn total(&self) -> Duration {
        let base = *self.accumulated.lock();
        if self.running.load(Ordering::Acquire) {
            if let Some(start) = *self.started_at.lock() {
                return base + start.elapsed();
            }
        }
        base
    }

    pub fn reset(&self) {
        self.running.store(false, Ordering::Release);
        *self.started_at.lock() = None;
        *self.accumulated.lock() = Duration::ZERO;
    }
}

impl Default for PauseTimeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn expires_after_timeout_when_left_alone() {
        let (tx, rx) = mpsc::channel();
        let watchdog = PauseWatchdog::start(move |expired| {
            tx.send(expired).unwrap();
        });
        watchdog.restart();
        let expired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(expired);
    }

    #[test]
    fn stop_cancels_with_expired_false() {
        let (tx, rx) = mpsc::channel();
        let watchdog = PauseWatchdog::start(move |expired| {
            tx.send(expired).unwrap();
        });
        watchdog.restart();
        watchdog.stop();
        let expired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!expired);
    }

    #[test]
    fn pause_time_monitor_accumulates_across_intervals() {
        let monitor = PauseTimeMonitor::new();
        monitor.update_time_interval();
        std::thread::sleep(Duration::from_millis(20));
        monitor.stop_time_interval();
        let first = monitor.total();
        assert!(first >= Duration::from_millis(15));

        monitor.update_time_interval();
        std::thread::sleep(Duration::from_millis(20));
        monitor.stop_time_interval();
        assert!(monitor.total() >= first + Duration::from_millis(15));
    }

    #[test]
    fn reset_clears_accumulated_time() {
        let monitor = PauseTimeMonitor::new();
        monitor.update_time_interval();
        std::thread::sleep(Duration::from_millis(10));
        monitor.stop_time_interval();
        monitor.reset();
        assert_eq!(monitor.total(), Duration::ZERO);
    }
}
