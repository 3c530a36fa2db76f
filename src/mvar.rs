//! Monitored Variable (MVar) bus, §4.7.
//!
//! A process-wide registry mapping a string id to a typed cell. Every read,
//! write, and observer notification is serialized by one global lock;
//! observers are invoked synchronously under that lock and must not call
//! back into the registry. Observer references are held weakly and pruned
//! as they're encountered, so a dropped subscriber is simply forgotten
//! rather than leaked.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};

/// The known IDs the core publishes to (§4.7).
pub mod ids {
    pub const DRM0: &str = "drm0";
    pub const ECM0: &str = "ecm0";
    pub const PMT0: &str = "pmt0";
    pub const PAT0: &str = "pat0";
    pub const FLUSH0: &str = "flush0";
    pub const CDM0: &str = "cdm0";
    pub const TRICK_PLAY0: &str = "trick_play0";
    pub const BUFFER_SRC_LOST0: &str = "bufferSrcLost0";
}

#[derive(Debug, Clone, PartialEq)]
pub enum MvarValue {
    Empty,
    Bool(bool),
    I16(i16),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Default for MvarValue {
    fn default() -> Self {
        MvarValue::Empty
    }
}

type Observer = dyn Fn(&MvarValue, &MvarValue, &str) + Send + Sync;

#[derive(Default)]
struct Cell {
    value: MvarValue,
    observers: Vec<Weak<Observer>>,
}

struct Registry {
    cells: Mutex<HashMap<String, Cell>>,
    cv: Condvar,
}

lazy_static! {
    static ref REGISTRY: Registry = Registry {
        cells: Mutex::new(HashMap::new()),
        cv: Condvar::new(),
    };
}

/// Write `value` to `id`, pruning expired observers and notifying the
/// survivors synchronously with `(old, new, id)` before returning.
pub fn write(id: &str, value: MvarValue) {
    let mut cells = REGISTRY.cells.lock();
    let cell = cells.entry(id.to_string()).or_default();
    let old = cell.value.clone();
    cell.observers.retain(|w| w.strong_count() > 0);
    for weak in &cell.observers {
        if let Some(obs) = weak.upgrade() {
            obs(&old, &value, id);
        }
    }
    cell.value = value;
    REGISTRY.cv.notify_all();
}

pub fn read(id: &str) -> MvarValue {
    REGISTRY
        .cells
        .lock()
        .get(id)
        .map(|c| c.value.clone())
        .unwrap_or(MvarValue::Empty)
}

/// Subscribe to `id`. The registry holds only a weak reference — the
/// caller must keep the returned `Arc` alive for as long as it wants
/// notifications.
pub fn subscribe(id: &str, observer: &Arc<Observer>) {
    let mut cells = REGISTRY.cells.lock();
    let cell = cells.entry(id.to_string()).or_default();
    cell.observers.push(Arc::downgrade(observer));
}

/// Block until `id`'s value satisfies `predicate`, or `timeout` elapses.
/// Returns the satisfying value, or `None` on timeout.
pub fn wait_for_value<F>(id: &str, predicate: F, timeout: Duration) -> Option<MvarValue>
where
    F: Fn(&MvarValue) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut cells = REGISTRY.cells.lock();
    loop {
        if let Some(cell) = cells.get(id) {
            if predicate(&cell.value) {
                return Some(cell.value.clone());
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let result = REGISTRY.cv.wait_for(&mut cells, deadline - now);
        if result.timed_out() {
            if let Some(cell) = cells.get(id) {
                if predicate(&cell.value) {
                    return Some(cell.value.clone());
                }
            }
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn write_then_read_round_trips() {
        let id = "test_write_then_read";
        write(id, MvarValue::I16(4));
        assert_eq!(read(id), MvarValue::I16(4));
    }

    #[test]
    fn observer_is_notified_with_old_and_new() {
        let id = "test_observer_notified";
        write(id, MvarValue::Empty);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let observer: Arc<Observer> = Arc::new(move |old, new, observed_id| {
            *seen2.lock() = Some((old.clone(), new.clone(), observed_id.to_string()));
        });
        subscribe(id, &observer);
        write(id, MvarValue::Text("hello".into()));
        let (old, new, observed_id) = seen.lock().clone().unwrap();
        assert_eq!(old, MvarValue::Empty);
        assert_eq!(new, MvarValue::Text("hello".into()));
        assert_eq!(observed_id, id);
    }

    #[test]
    fn dropped_observer_is_pruned_and_not_called() {
        let id = "test_dropped_observer";
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        {
            let observer: Arc<Observer> = Arc::new(move |_, _, _| {
                count2.fetch_add(1, Ordering::SeqCst);
            });
            subscribe(id, &observer);
        }
        // observer dropped here
        write(id, MvarValue::I16(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_for_value_observes_a_later_write() {
        let id = "test_wait_for_value";
        write(id, MvarValue::I16(0));
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            write(id, MvarValue::I16(42));
        });
        let got = wait_for_value(id, |v| matches!(v, MvarValue::I16(42)), Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got, Some(MvarValue::I16(42)));
    }

    #[test]
    fn wait_for_value_times_out() {
        let id = "test_wait_for_value_timeout";
        write(id, MvarValue::I16(0));
        let got = wait_for_value(id, |v| matches!(v, MvarValue::I16(99)), Duration::from_millis(30));
        assert_eq!(got, None);
    }
}
