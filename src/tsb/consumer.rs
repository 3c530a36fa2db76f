//! TSB Consumer: seek state, trick-play, and pause handling atop the ring
//! and indexer, §4.4.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::mvar::{self, ids, MvarValue};
use crate::tsb::indexer::BufferIndexer;
use crate::tsb::ring::RingBufferPool;
use crate::tsb::trickplay::{compute_trick_tick, TrickPlayTimer};
use crate::tsb::watchdog::{PauseTimeMonitor, PauseWatchdog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Undef,
    Ready,
    Playing,
    Paused,
}

impl Default for PlayerState {
    fn default() -> Self {
        PlayerState::Undef
    }
}

#[derive(Default)]
struct HandleTable {
    anchor: Option<u64>,
    offsets: HashMap<u64, u64>,
}

pub struct TsbConsumer {
    ring: Arc<RingBufferPool>,
    indexer: Arc<BufferIndexer>,
    seek_byte_offset: AtomicU64,
    is_streaming: AtomicBool,
    is_paused: AtomicBool,
    player_state: Mutex<PlayerState>,
    trick_play_speed: AtomicI16,
    handles: Mutex<HandleTable>,
    /// Held across `read_data` and `set_seek_time`, per §5.
    seek_mutex: Mutex<()>,
    watchdog: Mutex<Option<PauseWatchdog>>,
    pause_monitor: PauseTimeMonitor,
    trick_timer: TrickPlayTimer,
    first_sample_seen: AtomicBool,
    channel: Mutex<String>,
}

impl TsbConsumer {
    pub fn new(ring: Arc<RingBufferPool>, indexer: Arc<BufferIndexer>) -> Arc<Self> {
        Arc::new(Self {
            ring,
            indexer,
            seek_byte_offset: AtomicU64::new(0),
            is_streaming: AtomicBool::new(false),
            is_paused: AtomicBool::new(false),
            player_state: Mutex::new(PlayerState::Undef),
            trick_play_speed: AtomicI16::new(1),
            handles: Mutex::new(HandleTable::default()),
            seek_mutex: Mutex::new(()),
            watchdog: Mutex::new(None),
            pause_monitor: PauseTimeMonitor::new(),
            trick_timer: TrickPlayTimer::new(),
            first_sample_seen: AtomicBool::new(false),
            channel: Mutex::new(String::new()),
        })
    }

    pub fn on_open(self: &Arc<Self>, channel: &str) {
        *self.channel.lock() = channel.to_string();
        self.seek_byte_offset.store(0, Ordering::Release);
        self.is_paused.store(false, Ordering::Release);
        *self.player_state.lock() = PlayerState::Ready;
        self.trick_play_speed.store(1, Ordering::Release);
        self.handles.lock().offsets.clear();
        self.handles.lock().anchor = None;
        self.first_sample_seen.store(false, Ordering::Release);
        self.pause_monitor.reset();
        self.stop_watchdog();
        self.trick_timer.stop();
        self.is_streaming.store(true, Ordering::Release);
    }

    pub fn on_end_of_stream(&self) {
        self.is_streaming.store(false, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming.load(Ordering::Acquire)
    }

    pub fn player_state(&self) -> PlayerState {
        *self.player_state.lock()
    }

    /// `post(buffer)`: called from the consumer loop for every chunk.
    pub fn post(self: &Arc<Self>, chunk: &[u8]) {
        if !self.is_streaming() {
            return;
        }
        self.ring.push(chunk);
        let total_bytes = self.ring.total_bytes();
        self.indexer.register(total_bytes);

        let first_sample = self
            .first_sample_seen
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if *self.player_state.lock() == PlayerState::Paused {
            if first_sample {
                self.ensure_watchdog_started();
            }
            if self.is_paused.load(Ordering::Acquire) {
                self.advance_anchor_with_live(total_bytes);
            }
        }
    }

    fn advance_anchor_with_live(&self, live_bytes: u64) {
        let mut handles = self.handles.lock();
        let Some(anchor_id) = handles.anchor else {
            return;
        };
        let anchor_offset = *handles.offsets.get(&anchor_id).unwrap_or(&live_bytes);
        let delta = live_bytes as i64 - anchor_offset as i64;
        if delta > 0 {
            self.pause_monitor.stop_time_interval();
        } else {
            self.pause_monitor.update_time_interval();
        }

        let indexed_bytes = self.indexer.size_in_bytes().max(live_bytes);
        let new_anchor_offset = (anchor_offset as i64 + delta).max(0) as u64;
        handles
            .offsets
            .insert(anchor_id, new_anchor_offset.min(indexed_bytes));

        let new_seek = (self.seek_byte_offset.load(Ordering::Acquire) as i64 + delta).max(0) as u64;
        self.seek_byte_offset
            .store(new_seek.min(indexed_bytes), Ordering::Release);
    }

    /// `read_data(handle, dst, len)`.
    pub fn read_data(self: &Arc<Self>, handle: u64, dst: &mut [u8]) -> usize {
        let _seek_guard = self.seek_mutex.lock();
        let live = self.ring.total_bytes();

        let mut handles = self.handles.lock();
        if !handles.offsets.contains_key(&handle) {
            handles.offsets.insert(handle, live);
            if handles.anchor.is_none() {
                handles.anchor = Some(handle);
            }
        }
        let offset = *handles.offsets.get(&handle).unwrap();
        drop(handles);

        let seek = self.seek_byte_offset.load(Ordering::Acquire);
        let absolute_target = offset.saturating_sub(seek);
        let offset_from_oldest = absolute_target.saturating_sub(self.ring.oldest_exposed_bytes());

        let n = self.ring.read_random_access(dst, dst.len(), offset_from_oldest);

        let mut handles = self.handles.lock();
        handles.offsets.insert(handle, offset + n as u64);
        drop(handles);

        if *self.player_state.lock() == PlayerState::Paused {
            self.restart_watchdog();
        }
        n
    }

    pub fn release_handle(&self, handle: u64) {
        let mut handles = self.handles.lock();
        handles.offsets.remove(&handle);
        if handles.anchor == Some(handle) {
            handles.anchor = handles.offsets.keys().next().copied();
        }
    }

    /// `set_seek_time(ms)`.
    pub fn set_seek_time(self: &Arc<Self>, ms: u64, max_seek_ms: u64) -> Result<()> {
        let _seek_guard = self.seek_mutex.lock();
        let clamped_ms = ms.min(max_seek_ms);
        let (res, byte_offset) = self.indexer.byte_offset_from_time_us(clamped_ms * 1000);
        if res.is_err() {
            return Err(EngineError::IndexerOutOfRange);
        }

        self.seek_byte_offset.store(byte_offset, Ordering::Release);
        self.pause_monitor.reset();

        let live = self.ring.total_bytes();
        {
            let mut handles = self.handles.lock();
            for offset in handles.offsets.values_mut() {
                *offset = live;
            }
        }

        if *self.player_state.lock() == PlayerState::Paused {
            self.restart_watchdog();
        }
        Ok(())
    }

    /// `get_seek_time()`, in milliseconds.
    pub fn get_seek_time(&self) -> u64 {
        let byte_offset = self.seek_byte_offset.load(Ordering::Acquire);
        let (_, time_us) = self.indexer.time_us_from_byte_offset(byte_offset);
        let pause_us = self.pause_monitor.total().as_micros() as u64;
        (time_us + pause_us) / 1000
    }

    /// Current seek position, in bytes behind live.
    pub fn seek_offset_bytes(&self) -> u64 {
        self.seek_byte_offset.load(Ordering::Acquire)
    }

    /// Total ring capacity, in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.ring.capacity() as u64 * self.ring.chunk_size() as u64
    }

    /// Current trick-play speed.
    pub fn trick_play_speed(&self) -> i16 {
        self.trick_play_speed.load(Ordering::Acquire)
    }

    /// `set_trick_play_speed(speed)`.
    pub fn set_trick_play_speed(self: &Arc<Self>, speed: i16, max_seek_ms: u64) {
        if speed == 0 {
            return;
        }
        let previous = self.trick_play_speed.swap(speed, Ordering::AcqRel);
        mvar::write(ids::TRICK_PLAY0, MvarValue::I16(speed));
        if previous != speed {
            self.start_trick_timer(max_seek_ms);
        }
    }

    fn start_trick_timer(self: &Arc<Self>, max_seek_ms: u64) {
        self.ring.set_read_throttle(false);
        let weak = Arc::downgrade(self);
        self.trick_timer.start_if_idle(move || match weak.upgrade() {
            Some(this) => this.trick_tick(max_seek_ms),
            None => false,
        });
    }

    fn trick_tick(self: &Arc<Self>, max_seek_ms: u64) -> bool {
        let current_ms = self.get_seek_time() as i64;
        let speed = self.trick_play_speed.load(Ordering::Acquire);
        let tick = compute_trick_tick(current_ms, speed, max_seek_ms as i64);

        if tick.stop {
            self.ring.set_read_throttle(true);
        }
        self.trick_play_speed.store(tick.speed, Ordering::Release);
        mvar::write(ids::TRICK_PLAY0, MvarValue::I16(tick.speed));

        let _ = self.set_seek_time(tick.seek_ms.max(0) as u64, max_seek_ms);
        mvar::write(ids::FLUSH0, MvarValue::Bytes(vec![1]));

        !tick.stop
    }

    pub fn set_player_state(self: &Arc<Self>, state: PlayerState) {
        let previous = {
            let mut guard = self.player_state.lock();
            let previous = *guard;
            *guard = state;
            previous
        };
        match state {
            PlayerState::Paused => self.ensure_watchdog_started(),
            _ if previous == PlayerState::Paused => {
                self.stop_watchdog();
                self.is_paused.store(false, Ordering::Release);
                self.pause_monitor.reset();
            }
            _ => {}
        }
    }

    fn ensure_watchdog_started(self: &Arc<Self>) {
        let mut guard = self.watchdog.lock();
        if guard.is_none() {
            let weak = Arc::downgrade(self);
            *guard = Some(PauseWatchdog::start(move |expired| {
                if let Some(this) = weak.upgrade() {
                    if expired {
                        this.is_paused.store(true, Ordering::Release);
                        this.pause_monitor.update_time_interval();
                    } else {
                        this.is_paused.store(false, Ordering::Release);
                        this.pause_monitor.stop_time_interval();
                    }
                }
            }));
        }
        if let Some(wd) = guard.as_ref() {
            wd.restart();
        }
    }

    fn restart_watchdog(self: &Arc<Self>) {
        self.ensure_watchdog_started();
    }

    fn stop_watchdog(&self) {
        if let Some(wd) = self.watchdog.lock().as_ref() {
            wd.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_consumer(chunk_size: usize, capacity: usize) -> Arc<TsbConsumer> {
        let ring = Arc::new(RingBufferPool::new(capacity, chunk_size, 2));
        let indexer = Arc::new(BufferIndexer::new(capacity, 1));
        TsbConsumer::new(ring, indexer)
    }

    #[test]
    fn fresh_handle_starts_at_live() {
        let consumer = new_consumer(4, 16);
        consumer.on_open("chan");
        consumer.post(&[1, 2, 3, 4]);
        consumer.post(&[5, 6, 7, 8]);
        let mut dst = [0u8; 4];
        // A fresh handle starts at live, so it reads nothing until the next push.
        assert_eq!(consumer.read_data(1, &mut dst), 0);
    }

    #[test]
    fn seek_to_zero_reads_live_data() {
        let consumer = new_consumer(4, 16);
        consumer.on_open("chan");
        consumer.post(&[1, 2, 3, 4]);
        consumer.set_seek_time(0, 3_600_000).unwrap();
        consumer.post(&[5, 6, 7, 8]);
        let mut dst = [0u8; 4];
        assert_eq!(consumer.read_data(1, &mut dst), 4);
        assert_eq!(dst, [5, 6, 7, 8]);
    }

    #[test]
    fn dropped_chunks_do_not_arrive_before_on_open() {
        let consumer = new_consumer(4, 16);
        consumer.post(&[9, 9, 9, 9]);
        assert_eq!(consumer.ring.total_bytes(), 0);
    }

    #[test]
    fn pause_advances_anchor_handle_by_chunk_size_each_post() {
        let consumer = new_consumer(4, 64);
        consumer.on_open("chan");
        consumer.post(&[0; 4]);
        let mut dst = [0u8; 4];
        consumer.read_data(1, &mut dst); // creates handle, anchors it at live (4 bytes)
        consumer.set_player_state(PlayerState::Paused);
        consumer.is_paused.store(true, Ordering::Release);

        let before = *consumer.handles.lock().offsets.get(&1).unwrap();
        consumer.post(&[0; 4]);
        let after = *consumer.handles.lock().offsets.get(&1).unwrap();
        assert_eq!(after, before + 4);
    }

    #[test]
    fn trick_tick_pure_math_reaches_live_and_stops() {
        let tick = compute_trick_tick(200, 4, 3_600_000);
        assert!(tick.stop);
        assert_eq!(tick.seek_ms, 0);
        assert_eq!(tick.speed, 1);
    }
}
