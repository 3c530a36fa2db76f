//! Byte↔time index with bisection search, §4.3.
//!
//! One `(timestamp_us, cumulative_byte_count)` pair is kept every
//! `SAMPLING_RATIO` chunks. The entries live in a capacity-bounded deque
//! that evicts its oldest entry once full — equivalent to the
//! `boost::circular_buffer` the original core indexes into, which makes the
//! deque's front always the index's "oldest exposed" entry with no separate
//! bookkeeping needed.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    Empty,
    OutOfRange,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    time_us: u64,
    bytes: u64,
}

#[derive(Clone, Copy)]
enum MemoKey {
    Time(u64),
    Offset(u64),
}

struct MemoEntry {
    key: MemoKey,
    result: (Option<IndexError>, u64),
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Linear interpolation of `val` between the pair straddling `target` in
/// `key`. `keys` and `vals` are parallel, both non-decreasing.
fn interpolate(keys: &[u64], vals: &[u64], target: u64) -> u64 {
    debug_assert_eq!(keys.len(), vals.len());
    let idx = keys.partition_point(|&k| k <= target);
    if idx == 0 {
        return vals[0];
    }
    if idx >= keys.len() {
        return vals[keys.len() - 1];
    }
    let (k0, k1) = (keys[idx - 1], keys[idx]);
    let (v0, v1) = (vals[idx - 1], vals[idx]);
    if k1 == k0 {
        return v0;
    }
    let frac = (target - k0) as f64 / (k1 - k0) as f64;
    v0 + ((v1 - v0) as f64 * frac) as u64
}

struct IndexerState {
    entries: VecDeque<Entry>,
    calls_since_sample: usize,
    memo: Option<MemoEntry>,
}

pub struct BufferIndexer {
    capacity: usize,
    sampling_ratio: usize,
    state: Mutex<IndexerState>,
}

impl BufferIndexer {
    pub fn new(capacity: usize, sampling_ratio: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sampling_ratio: sampling_ratio.max(1),
            state: Mutex::new(IndexerState {
                entries: VecDeque::new(),
                calls_since_sample: 0,
                memo: None,
            }),
        }
    }

    /// Register the cumulative byte count for a newly pushed chunk. Returns
    /// `(registered, current_size)` — `registered` is `false` on the
    /// `SAMPLING_RATIO`-1 calls in between samples.
    pub fn register(&self, cumulative_bytes: u64) -> (bool, usize) {
        let mut state = self.state.lock();
        state.calls_since_sample += 1;
        if state.calls_since_sample < self.sampling_ratio {
            return (false, state.entries.len());
        }
        state.calls_since_sample = 0;

        let entry = Entry {
            time_us: now_us(),
            bytes: cumulative_bytes,
        };
        if let Some(back) = state.entries.back() {
            debug_assert!(entry.time_us >= back.time_us);
            debug_assert!(entry.bytes >= back.bytes);
        }
        if state.entries.len() == self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(entry);
        state.memo = None;
        (true, state.entries.len())
    }

    /// Map a relative seek time (microseconds behind live) to a byte offset
    /// behind live.
    pub fn byte_offset_from_time_us(&self, t: u64) -> (Result<(), IndexError>, u64) {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return (Err(IndexError::Empty), 0);
        }
        if t == 0 {
            return (Ok(()), 0);
        }
        if let Some(memo) = &state.memo {
            if matches!(memo.key, MemoKey::Time(k) if k == t) {
                let (err, v) = memo.result;
                return (err.map_or(Ok(()), Err), v);
            }
        }

        let front = *state.entries.front().unwrap();
        let back = *state.entries.back().unwrap();

        let result = if front.time_us + t > back.time_us {
            (Err(IndexError::OutOfRange), back.bytes - front.bytes)
        } else {
            let target = back.time_us - t;
            let keys: Vec<u64> = state.entries.iter().map(|e| e.time_us).collect();
            let vals: Vec<u64> = state.entries.iter().map(|e| e.bytes).collect();
            let interp = interpolate(&keys, &vals, target);
            (Ok(()), back.bytes - interp)
        };

        state.memo = Some(MemoEntry {
            key: MemoKey::Time(t),
            result: (result.0.err(), result.1),
        });
        (result.0, result.1)
    }

    /// Map a byte offset behind live to a relative time behind live, in
    /// microseconds. Symmetric with [`Self::byte_offset_from_time_us`].
    pub fn time_us_from_byte_offset(&self, off: u64) -> (Result<(), IndexError>, u64) {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return (Err(IndexError::Empty), 0);
        }
        if off == 0 {
            return (Ok(()), 0);
        }
        if let Some(memo) = &state.memo {
            if matches!(memo.key, MemoKey::Offset(k) if k == off) {
                let (err, v) = memo.result;
                return (err.map_or(Ok(()), Err), v);
            }
        }

        let front = *state.entries.front().unwrap();
        let back = *state.entries.back().unwrap();

        let result = if front.bytes + off > back.bytes {
            (Err(IndexError::OutOfRange), back.time_us - front.time_us)
        } else {
            let target_bytes = back.bytes - off;
            let keys: Vec<u64> = state.entries.iter().map(|e| e.bytes).collect();
            let vals: Vec<u64> = state.entries.iter().map(|e| e.time_us).collect();
            let interp = interpolate(&keys, &vals, target_bytes);
            (Ok(()), back.time_us - interp)
        };

        state.memo = Some(MemoEntry {
            key: MemoKey::Offset(off),
            result: (result.0.err(), result.1),
        });
        (result.0, result.1)
    }

    /// Map an absolute byte index to the absolute (EPOCH) timestamp
    /// recorded when that byte was produced. Clamps to the endpoints,
    /// still returning the endpoint's timestamp when out of range.
    pub fn timestamp_us_for_byte_index(&self, idx: u64) -> (Result<(), IndexError>, u64) {
        let state = self.state.lock();
        if state.entries.is_empty() {
            return (Err(IndexError::Empty), 0);
        }
        let front = *state.entries.front().unwrap();
        let back = *state.entries.back().unwrap();

        if idx <= front.bytes {
            let err = if idx < front.bytes {
                Err(IndexError::OutOfRange)
            } else {
                Ok(())
            };
            return (err, front.time_us);
        }
        if idx >= back.bytes {
            let err = if idx > back.bytes {
                Err(IndexError::OutOfRange)
            } else {
                Ok(())
            };
            return (err, back.time_us);
        }

        let keys: Vec<u64> = state.entries.iter().map(|e| e.bytes).collect();
        let vals: Vec<u64> = state.entries.iter().map(|e| e.time_us).collect();
        (Ok(()), interpolate(&keys, &vals, idx))
    }

    pub fn size_in_time_us(&self) -> u64 {
        let state = self.state.lock();
        match (state.entries.front(), state.entries.back()) {
            (Some(f), Some(b)) => b.time_us - f.time_us,
            _ => 0,
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        let state = self.state.lock();
        match (state.entries.front(), state.entries.back()) {
            (Some(f), Some(b)) => b.bytes - f.bytes,
            _ => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.calls_since_sample = 0;
        state.memo = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn seed(indexer: &BufferIndexer, n: usize, bytes_per: u64) {
        for i in 0..n {
            let (_, _) = indexer.register((i as u64 + 1) * bytes_per);
            sleep(Duration::from_micros(200));
        }
    }

    #[test]
    fn entries_are_monotonic() {
        let indexer = BufferIndexer::new(16, 1);
        seed(&indexer, 8, 4096);
        // internal monotonicity already asserted in register(); spot check
        // size reflects strictly increasing bytes/time across the window.
        assert!(indexer.size_in_bytes() > 0);
        assert!(indexer.size_in_time_us() > 0);
    }

    #[test]
    fn empty_indexer_reports_empty() {
        let indexer = BufferIndexer::new(16, 1);
        let (err, _) = indexer.byte_offset_from_time_us(100);
        assert_eq!(err, Err(IndexError::Empty));
    }

    #[test]
    fn zero_time_maps_to_zero_offset() {
        let indexer = BufferIndexer::new(16, 1);
        seed(&indexer, 4, 4096);
        let (err, off) = indexer.byte_offset_from_time_us(0);
        assert_eq!(err, Ok(()));
        assert_eq!(off, 0);
    }

    #[test]
    fn round_trip_within_quantisation() {
        let indexer = BufferIndexer::new(64, 1);
        seed(&indexer, 32, 4096);
        let size = indexer.size_in_bytes();
        let probe = size / 2;
        let (_, t) = indexer.time_us_from_byte_offset(probe);
        let (_, b) = indexer.byte_offset_from_time_us(t);
        let diff = (b as i64 - probe as i64).abs();
        // One sample's worth of quantisation.
        assert!(diff <= 4096);
    }

    #[test]
    fn sampling_ratio_skips_intermediate_calls() {
        let indexer = BufferIndexer::new(16, 4);
        let (reg0, _) = indexer.register(4096);
        assert!(!reg0);
        let (reg1, _) = indexer.register(8192);
        assert!(!reg1);
        let (reg2, _) = indexer.register(12288);
        assert!(!reg2);
        let (reg3, _) = indexer.register(16384);
        assert!(reg3);
    }

    #[test]
    fn clear_resets_state() {
        let indexer = BufferIndexer::new(16, 1);
        seed(&indexer, 4, 4096);
        indexer.clear();
        assert_eq!(indexer.size_in_bytes(), 0);
        let (err, _) = indexer.byte_offset_from_time_us(1);
        assert_eq!(err, Err(IndexError::Empty));
    }
}
