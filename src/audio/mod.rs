// Audio module - sensor input capture and the block pool feeding the detector

pub mod buffer_pool;
pub mod capture;

pub use buffer_pool::{
    BufferPool, BufferPoolChannels, CaptureChannels, DetectorChannels, SampleBlock,
    DEFAULT_BLOCK_FRAMES, DEFAULT_BUFFER_COUNT,
};
pub use capture::{BlockAssembler, InputCapture, ADC_FULL_SCALE};
