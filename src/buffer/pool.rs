//! Fixed-count producer-buffer pool, §3.
//!
//! Buffers are created once at startup and reused for the engine's
//! lifetime; ownership never transfers out of the pool, only buffer ids
//! move between the ingress queue's two halves (see [`super::queue`]).

use parking_lot::Mutex;

/// One pooled producer buffer. `payload` is pre-allocated to `capacity` and
/// never reallocated; `size` tracks how many of its bytes are valid.
pub struct ProducerBuffer {
    pub id: usize,
    pub size: usize,
    pub capacity: usize,
    pub channel_info: String,
    pub payload: Vec<u8>,
}

impl ProducerBuffer {
    fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            size: 0,
            capacity,
            channel_info: String::new(),
            payload: vec![0u8; capacity],
        }
    }

    /// Fill with a null-TS pattern: `47 1F FF 10` header, zero payload,
    /// one `TS_PACKET_SIZE` packet repeated to fill the buffer. Used by the
    /// media source coordinator's loss-injection path (§4.6).
    pub fn fill_null_ts(&mut self, packet_size: usize) {
        let n_packets = self.capacity / packet_size;
        self.payload[..self.capacity].fill(0);
        for i in 0..n_packets {
            let off = i * packet_size;
            self.payload[off] = 0x47;
            self.payload[off + 1] = 0x1F;
            self.payload[off + 2] = 0xFF;
            self.payload[off + 3] = 0x10;
        }
        self.size = n_packets * packet_size;
    }
}

/// Fixed-count pool of producer buffers (`POOL_COUNT` entries), each
/// independently mutex-protected so the ingress queue can hand out ids
/// without the pool itself needing a lock.
pub struct BufferPool {
    buffers: Vec<Mutex<ProducerBuffer>>,
}

impl BufferPool {
    pub fn new(pool_count: usize, buffer_capacity: usize) -> Self {
        let buffers = (0..pool_count)
            .map(|id| Mutex::new(ProducerBuffer::new(id, buffer_capacity)))
            .collect();
        Self { buffers }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn lock(&self, id: usize) -> parking_lot::MutexGuard<'_, ProducerBuffer> {
        self.buffers[id].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_ts_packets_start_with_the_expected_header() {
        let mut buf = ProducerBuffer::new(0, 188 * 4);
        buf.fill_null_ts(188);
        for chunk in buf.payload.chunks(188) {
            assert_eq!(&chunk[..4], &[0x47, 0x1F, 0xFF, 0x10]);
        }
    }

    #[test]
    fn pool_buffers_are_independently_lockable() {
        let pool = BufferPool::new(4, 64);
        {
            let mut b0 = pool.lock(0);
            b0.size = 10;
        }
        let b1 = pool.lock(1);
        assert_eq!(b1.size, 0);
    }
}
