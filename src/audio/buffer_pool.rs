// BufferPool - lock-free sample block pool with dual SPSC queues
//
// Implements an object pool pattern using two lock-free SPSC (Single Producer Single Consumer)
// ring buffers between the input callback and the detector thread. All blocks are allocated
// up front so the input callback never touches the heap.
//
// Architecture:
// - DATA_QUEUE: Input callback pushes filled blocks, detector thread consumes
// - POOL_QUEUE: Detector thread returns empty blocks, input callback recycles
//
// Block flow:
// 1. Input callback pops an empty block from POOL_QUEUE
// 2. Input callback fills it with averaged (kick, snare) frames
// 3. Input callback pushes the filled block to DATA_QUEUE and wakes the detector
// 4. Detector thread pops filled blocks from DATA_QUEUE (only the newest is processed)
// 5. Detector thread pushes every block back to POOL_QUEUE

use rtrb::{Consumer, Producer};

use crate::state::Micros;

/// Configuration constants for the block pool
pub const DEFAULT_BUFFER_COUNT: usize = 16;
pub const DEFAULT_BLOCK_FRAMES: usize = 32;

/// A run of detector frames captured back to back.
///
/// Each frame holds one oversample-averaged integer sample per channel
/// (`[kick, snare]`). Frame `i` was captured at
/// `start_us + i * frame_period_us`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub start_us: Micros,
    pub frame_period_us: f64,
    pub frames: Vec<[u16; 2]>,
    max_frames: usize,
}

impl SampleBlock {
    pub fn with_capacity(frames: usize) -> Self {
        Self {
            start_us: 0,
            frame_period_us: 0.0,
            frames: Vec::with_capacity(frames),
            max_frames: frames,
        }
    }

    /// Build a block from already-averaged frames
    pub fn from_frames(start_us: Micros, frame_period_us: f64, frames: Vec<[u16; 2]>) -> Self {
        let max_frames = frames.len();
        Self {
            start_us,
            frame_period_us,
            frames,
            max_frames,
        }
    }

    /// Empty the block for reuse, keeping its allocation
    pub fn reset(&mut self, start_us: Micros, frame_period_us: f64) {
        self.start_us = start_us;
        self.frame_period_us = frame_period_us;
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.max_frames
    }

    /// Capture time of frame `index`
    pub fn frame_time(&self, index: usize) -> Micros {
        self.start_us + (index as f64 * self.frame_period_us).round() as Micros
    }
}

/// Split block pool channels for producer/consumer separation
pub struct BufferPoolChannels {
    /// Producer for sending filled blocks to the detector thread
    pub data_producer: Producer<SampleBlock>,
    /// Consumer for receiving filled blocks in the detector thread
    pub data_consumer: Consumer<SampleBlock>,
    /// Producer for returning empty blocks from the detector thread
    pub pool_producer: Producer<SampleBlock>,
    /// Consumer for retrieving empty blocks in the input callback
    pub pool_consumer: Consumer<SampleBlock>,
}

/// Ends of the pool owned by the input callback
pub struct CaptureChannels {
    pub data_producer: Producer<SampleBlock>,
    pub pool_consumer: Consumer<SampleBlock>,
}

/// Ends of the pool owned by the detector thread
pub struct DetectorChannels {
    pub data_consumer: Consumer<SampleBlock>,
    pub pool_producer: Producer<SampleBlock>,
}

impl BufferPoolChannels {
    /// Hand each side its two queue ends
    pub fn split(self) -> (CaptureChannels, DetectorChannels) {
        (
            CaptureChannels {
                data_producer: self.data_producer,
                pool_consumer: self.pool_consumer,
            },
            DetectorChannels {
                data_consumer: self.data_consumer,
                pool_producer: self.pool_producer,
            },
        )
    }
}

/// Lock-free block pool using dual SPSC ring buffers
///
/// Pre-allocates a fixed number of sample blocks and manages them through
/// two lock-free queues. Both queues can hold every block, so a push of a
/// block taken from the pool never fails.
pub struct BufferPool;

impl BufferPool {
    /// Create a new pool of `buffer_count` blocks of `block_frames` frames each
    ///
    /// Zero arguments are raised to one.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(buffer_count: usize, block_frames: usize) -> BufferPoolChannels {
        let buffer_count = buffer_count.max(1);
        let block_frames = block_frames.max(1);

        let (mut pool_producer, pool_consumer) = rtrb::RingBuffer::new(buffer_count);
        let (data_producer, data_consumer) = rtrb::RingBuffer::new(buffer_count);

        // The only place where block allocation occurs
        for _ in 0..buffer_count {
            if pool_producer
                .push(SampleBlock::with_capacity(block_frames))
                .is_err()
            {
                break;
            }
        }

        BufferPoolChannels {
            data_producer,
            data_consumer,
            pool_producer,
            pool_consumer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_creation() {
        let mut channels = BufferPool::new(16, 32);

        let mut available = 0;
        while channels.pool_consumer.pop().is_ok() {
            available += 1;
        }
        assert_eq!(available, 16, "Expected 16 blocks in pool queue");
        assert!(
            channels.data_consumer.pop().is_err(),
            "Data queue should be empty initially"
        );
    }

    #[test]
    fn test_block_capacity_and_fill() {
        let mut channels = BufferPool::new(1, 4);
        let mut block = channels.pool_consumer.pop().expect("one block in pool");
        assert!(block.frames.capacity() >= 4);

        block.reset(1_000, 100.0);
        for i in 0..4 {
            assert!(!block.is_full());
            block.frames.push([i, i * 2]);
        }
        assert!(block.is_full());
        assert_eq!(block.frame_time(0), 1_000);
        assert_eq!(block.frame_time(3), 1_300);
    }

    #[test]
    fn test_block_circulation_through_split_ends() {
        let (mut capture, mut detector) = BufferPool::new(2, 8).split();

        let mut block = capture.pool_consumer.pop().expect("block in pool");
        block.reset(500, 166.7);
        block.frames.push([10, 20]);
        capture.data_producer.push(block).expect("push to data queue");

        let block = detector.data_consumer.pop().expect("block in data queue");
        assert_eq!(block.frames, vec![[10, 20]]);
        detector.pool_producer.push(block).expect("return to pool");

        assert!(capture.pool_consumer.pop().is_ok());
        assert!(capture.pool_consumer.pop().is_ok());
        assert!(capture.pool_consumer.pop().is_err());
    }

    #[test]
    fn test_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CaptureChannels>();
        assert_send::<DetectorChannels>();
    }

    #[test]
    fn test_zero_arguments_are_raised() {
        let mut channels = BufferPool::new(0, 0);
        let block = channels.pool_consumer.pop().expect("one block");
        assert!(block.is_empty());
        assert!(!block.is_full());
    }
}
