//! Fixed-capacity chunk ring with random-access reads, §4.2.
//!
//! The ring stores `capacity` fixed-size chunks. Once full, a push
//! overwrites the oldest physical chunk. A `tail_size` safety margin of
//! chunks is kept unreachable beyond the logically "oldest exposed"
//! position, so a reader lagging right at the edge never races a write that
//! is about to overwrite the chunk it's reading.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

struct RingState {
    chunks: Vec<Vec<u8>>,
    write_idx: usize,
    total_written: u64,
}

pub struct RingBufferPool {
    state: Mutex<RingState>,
    chunk_size: usize,
    capacity: usize,
    tail_size: usize,
    throttle_enabled: AtomicBool,
    aborted: AtomicBool,
    /// Mirrors `total_written` for lock-free observers (e.g. the monitor
    /// loop checking liveness); the lock above remains the source of truth.
    total_written_hint: AtomicU64,
}

impl RingBufferPool {
    pub fn new(capacity: usize, chunk_size: usize, tail_size: usize) -> Self {
        assert!(capacity > tail_size, "capacity must exceed the safety tail");
        let chunks = (0..capacity).map(|_| vec![0u8; chunk_size]).collect();
        Self {
            state: Mutex::new(RingState {
                chunks,
                write_idx: 0,
                total_written: 0,
            }),
            chunk_size,
            capacity,
            tail_size,
            throttle_enabled: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
            total_written_hint: AtomicU64::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one chunk at the head, overwriting the oldest physical slot
    /// once the ring is full.
    pub fn push(&self, chunk: &[u8]) {
        debug_assert_eq!(chunk.len(), self.chunk_size);
        let mut state = self.state.lock();
        let idx = state.write_idx;
        state.chunks[idx][..chunk.len()].copy_from_slice(chunk);
        state.write_idx = (idx + 1) % self.capacity;
        state.total_written += 1;
        self.total_written_hint
            .store(state.total_written, Ordering::Release);
    }

    /// Total bytes produced so far (the "live" byte count).
    pub fn total_bytes(&self) -> u64 {
        self.total_written_hint.load(Ordering::Acquire) * self.chunk_size as u64
    }

    /// The oldest exposed absolute chunk index, excluding the safety tail.
    fn oldest_exposed_chunk(total_written: u64, capacity: usize, tail_size: usize) -> u64 {
        let logical_cap = (capacity - tail_size) as u64;
        total_written.saturating_sub(logical_cap)
    }

    /// Oldest exposed byte offset (absolute, from stream start).
    pub fn oldest_exposed_bytes(&self) -> u64 {
        let state = self.state.lock();
        Self::oldest_exposed_chunk(state.total_written, self.capacity, self.tail_size)
            * self.chunk_size as u64
    }

    /// Copy up to `len` bytes starting at `offset_from_oldest`, measured
    /// from the oldest exposed chunk's first byte. Returns bytes copied;
    /// `0` if the offset is at or beyond the head, or after `abort_all_operations`.
    pub fn read_random_access(&self, dst: &mut [u8], len: usize, offset_from_oldest: u64) -> usize {
        if self.aborted.load(Ordering::Acquire) {
            return 0;
        }

        let state = self.state.lock();
        let oldest_abs_chunk =
            Self::oldest_exposed_chunk(state.total_written, self.capacity, self.tail_size);
        let start_abs_byte = oldest_abs_chunk * self.chunk_size as u64 + offset_from_oldest;
        let head_abs_byte = state.total_written * self.chunk_size as u64;

        if start_abs_byte >= head_abs_byte {
            return 0;
        }

        let avail = head_abs_byte - start_abs_byte;
        let to_copy = len.min(dst.len()).min(avail as usize);

        let mut copied = 0usize;
        let mut cursor = start_abs_byte;
        while copied < to_copy {
            let abs_chunk = cursor / self.chunk_size as u64;
            let within = (cursor % self.chunk_size as u64) as usize;
            let physical = (abs_chunk % self.capacity as u64) as usize;
            let chunk_remaining = self.chunk_size - within;
            let n = chunk_remaining.min(to_copy - copied);
            dst[copied..copied + n].copy_from_slice(&state.chunks[physical][within..within + n]);
            copied += n;
            cursor += n as u64;
        }
        copied
    }

    /// Disabled during trick-play so the TSB's own clock drives consumption
    /// instead of the ring's pacing gate.
    pub fn set_read_throttle(&self, enabled: bool) {
        self.throttle_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn read_throttle_enabled(&self) -> bool {
        self.throttle_enabled.load(Ordering::Relaxed)
    }

    /// Unblock any waiter and make subsequent reads return 0 promptly.
    pub fn abort_all_operations(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn clear_abort(&self) {
        self.aborted.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_before_any_push_returns_zero() {
        let ring = RingBufferPool::new(8, 4, 2);
        let mut dst = [0u8; 4];
        assert_eq!(ring.read_random_access(&mut dst, 4, 0), 0);
    }

    #[test]
    fn read_back_a_single_chunk() {
        let ring = RingBufferPool::new(8, 4, 2);
        ring.push(&[1, 2, 3, 4]);
        let mut dst = [0u8; 4];
        assert_eq!(ring.read_random_access(&mut dst, 4, 0), 4);
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn read_spans_two_chunks() {
        let ring = RingBufferPool::new(8, 4, 2);
        ring.push(&[1, 2, 3, 4]);
        ring.push(&[5, 6, 7, 8]);
        let mut dst = [0u8; 6];
        assert_eq!(ring.read_random_access(&mut dst, 6, 1), 6);
        assert_eq!(dst, [2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn overwrite_advances_oldest_exposed() {
        let capacity = 4;
        let tail = 1;
        let ring = RingBufferPool::new(capacity, 4, tail);
        for i in 0..10u8 {
            ring.push(&[i, i, i, i]);
        }
        // logical capacity = 3 chunks; 10 pushed => oldest exposed chunk = 7
        assert_eq!(ring.oldest_exposed_bytes(), 7 * 4);
        let mut dst = [0u8; 4];
        assert_eq!(ring.read_random_access(&mut dst, 4, 0), 4);
        assert_eq!(dst, [7, 7, 7, 7]);
    }

    #[test]
    fn offset_beyond_head_returns_zero() {
        let ring = RingBufferPool::new(8, 4, 2);
        ring.push(&[1, 2, 3, 4]);
        let mut dst = [0u8; 4];
        assert_eq!(ring.read_random_access(&mut dst, 4, 100), 0);
    }

    #[test]
    fn abort_causes_reads_to_return_zero() {
        let ring = RingBufferPool::new(8, 4, 2);
        ring.push(&[1, 2, 3, 4]);
        ring.abort_all_operations();
        let mut dst = [0u8; 4];
        assert_eq!(ring.read_random_access(&mut dst, 4, 0), 0);
    }
}
