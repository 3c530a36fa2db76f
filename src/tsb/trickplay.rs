//! Cyclic trick-play timer and the speed→seek-delta math, §4.4.
//!
//! The timer itself is policy-free: it just calls back every `TRICK_RATE_MS`
//! until the callback says to stop. All trick-play state (current seek,
//! speed, MVar publication) lives in [`super::consumer`], which supplies the
//! callback and uses [`compute_trick_tick`] to decide each step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::TRICK_RATE_MS;

/// Outcome of one trick-play tick, in the seek-time (ms) domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrickTick {
    pub seek_ms: i64,
    pub speed: i16,
    /// `true` if this was the last tick: the timer should stop and normal
    /// playback speed (`1`) resumes.
    pub stop: bool,
}

/// Pure step function for one `TRICK_RATE_MS` tick, per §4.4.
///
/// `speed == 1` is always a no-op that stops the timer without touching the
/// seek position. Negative speed rewinds (grows the seek-behind-live
/// distance); positive speed fast-forwards (shrinks it), snapping to normal
/// once it would cross the buffer's edge.
pub fn compute_trick_tick(current_seek_ms: i64, speed: i16, max_seek_ms: i64) -> TrickTick {
    let rate_ms = TRICK_RATE_MS as i64;

    if speed == 1 {
        return TrickTick {
            seek_ms: current_seek_ms,
            speed: 1,
            stop: true,
        };
    }

    let delta = rate_ms * speed as i64;

    if speed < 0 {
        let new_seek = current_seek_ms - delta + rate_ms;
        if new_seek >= max_seek_ms {
            return TrickTick {
                seek_ms: max_seek_ms,
                speed: 1,
                stop: true,
            };
        }
        TrickTick {
            seek_ms: new_seek,
            speed,
            stop: false,
        }
    } else {
        let new_seek = current_seek_ms - delta - rate_ms;
        if new_seek <= 0 {
            return TrickTick {
                seek_ms: 0,
                speed: 1,
                stop: true,
            };
        }
        TrickTick {
            seek_ms: new_seek,
            speed,
            stop: false,
        }
    }
}

struct Shared {
    running: AtomicBool,
}

/// A periodic ticker: runs `on_tick` every `TRICK_RATE_MS` until it returns
/// `false`, or until [`Self::stop`] is called.
pub struct TrickPlayTimer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TrickPlayTimer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Start the cyclic timer if it isn't already running. A no-op if one
    /// is already in flight — the running timer observes speed changes
    /// itself via whatever state `on_tick` closes over.
    pub fn start_if_idle<F>(&self, on_tick: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let shared = self.shared.clone();
        let handle = std::thread::spawn(move || {
            let period = Duration::from_millis(TRICK_RATE_MS);
            loop {
                std::thread::sleep(period);
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                if !on_tick() {
                    shared.running.store(false, Ordering::Release);
                    return;
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Force-stop the timer loop; safe to call whether or not it's running.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Block until a started timer's thread has exited. Used by tests and
    /// graceful shutdown paths; a no-op if nothing was ever started.
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for TrickPlayTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_speed_is_a_no_op_stop() {
        let tick = compute_trick_tick(5_000, 1, 3_600_000);
        assert_eq!(tick, TrickTick { seek_ms: 5_000, speed: 1, stop: true });
    }

    #[test]
    fn rewind_grows_seek_behind_live() {
        let tick = compute_trick_tick(10_000, -2, 3_600_000);
        assert!(!tick.stop);
        assert!(tick.seek_ms > 10_000);
    }

    #[test]
    fn rewind_snaps_to_normal_at_max_seek() {
        let tick = compute_trick_tick(3_599_900, -4, 3_600_000);
        assert!(tick.stop);
        assert_eq!(tick.speed, 1);
        assert_eq!(tick.seek_ms, 3_600_000);
    }

    #[test]
    fn fast_forward_shrinks_seek_behind_live() {
        let tick = compute_trick_tick(10_000, 2, 3_600_000);
        assert!(!tick.stop);
        assert!(tick.seek_ms < 10_000);
    }

    #[test]
    fn fast_forward_snaps_to_live_at_zero() {
        let tick = compute_trick_tick(200, 4, 3_600_000);
        assert!(tick.stop);
        assert_eq!(tick.speed, 1);
        assert_eq!(tick.seek_ms, 0);
    }

    #[test]
    fn timer_ticks_until_callback_says_stop() {
        use std::sync::atomic::AtomicUsize;
        let timer = TrickPlayTimer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        timer.start_if_idle(move || {
            let n = count2.fetch_add(1, Ordering::SeqCst) + 1;
            n < 2
        });
        timer.join();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!timer.is_running());
    }
}
