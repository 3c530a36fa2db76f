//! Time-shift buffer: ring storage, the byte↔time indexer, pause/trick-play
//! control, and the consumer that ties them together (§4.2–§4.4).

pub mod consumer;
pub mod indexer;
pub mod ring;
pub mod trickplay;
pub mod watchdog;

pub use consumer::{PlayerState, TsbConsumer};
pub use indexer::{BufferIndexer, IndexError};
pub use ring::RingBufferPool;
pub use trickplay::{compute_trick_tick, TrickPlayTimer, TrickTick};
pub use watchdog::{PauseTimeMonitor, PauseWatchdog};
