// Onset module - from captured samples to the shared onset log
//
// Architecture:
// - log: fixed-capacity lock-free ring of onset events (single writer)
// - detector: per-channel envelope/slope trigger and logging window
// - worker: the detector thread, woken per captured block

pub mod detector;
pub mod log;
pub mod worker;

pub use self::detector::{
    oversample_average, ChannelDetector, DetectorCommand, OnsetDetector, GAIN_CLIP_VALUE,
};
pub use self::log::{Instrument, OnsetEvent, OnsetLog, ONSET_LOG_CAPACITY};
pub use self::worker::{
    command_queue, spawn_detector_thread, DetectorHandle, DetectorLinks, DetectorMailbox,
    DetectorWaker, DetectorWorker, ServiceReport,
};
