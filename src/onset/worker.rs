// Detector worker - the thread that turns captured blocks into onsets
//
// The capture side pushes filled blocks and unparks this thread; the clock
// pushes logging-window commands and unparks it too. Each wake drains the
// commands first, then takes every pending block. Only the newest block is
// analysed: a backlog means the thread fell behind, so stale blocks go back
// to the pool unprocessed and the overrun is reported.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::audio::buffer_pool::{DetectorChannels, SampleBlock};
use crate::config::Tunables;
use crate::telemetry::TelemetryHub;
use crate::tracking::EvaluatorWake;

use super::detector::{DetectorCommand, OnsetDetector};

/// Commands the clock may have in flight to the detector
pub const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Everything the worker talks to besides its queues
#[derive(Clone)]
pub struct DetectorLinks {
    pub sync_wake: EvaluatorWake,
    pub tunables: Tunables,
    pub telemetry: Arc<TelemetryHub>,
    /// Blocks the capture side could not queue (data queue full)
    pub capture_overruns: Arc<AtomicU64>,
}

/// What one service pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceReport {
    pub commands: usize,
    pub processed_blocks: usize,
    pub dropped_blocks: usize,
    pub onsets: usize,
}

impl ServiceReport {
    pub fn is_idle(&self) -> bool {
        self.commands == 0 && self.processed_blocks == 0 && self.dropped_blocks == 0
    }
}

/// Wakes the detector thread after new input
#[derive(Debug, Clone)]
pub struct DetectorWaker {
    thread: Option<Thread>,
}

impl DetectorWaker {
    pub fn new(thread: Thread) -> Self {
        Self {
            thread: Some(thread),
        }
    }

    /// A waker for a detector that is serviced by hand (replay, tests)
    pub fn detached() -> Self {
        Self { thread: None }
    }

    pub fn wake(&self) {
        if let Some(thread) = &self.thread {
            thread.unpark();
        }
    }
}

/// Sending side of the detector command queue
pub struct DetectorMailbox {
    producer: Producer<DetectorCommand>,
    waker: DetectorWaker,
}

impl DetectorMailbox {
    pub fn new(producer: Producer<DetectorCommand>, waker: DetectorWaker) -> Self {
        Self { producer, waker }
    }

    /// Queue a command and wake the detector. Returns false if the queue was full.
    pub fn send(&mut self, command: DetectorCommand) -> bool {
        let queued = self.producer.push(command).is_ok();
        if !queued {
            tracing::warn!("[DetectorMailbox] Command queue full, dropped {:?}", command);
        }
        self.waker.wake();
        queued
    }
}

/// Command queue ends for a detector serviced in the current thread
pub fn command_queue() -> (Producer<DetectorCommand>, Consumer<DetectorCommand>) {
    RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}

pub struct DetectorWorker {
    detector: OnsetDetector,
    channels: DetectorChannels,
    commands: Consumer<DetectorCommand>,
    links: DetectorLinks,
    reported_capture_overruns: u64,
    total_dropped: u64,
}

impl DetectorWorker {
    pub fn new(
        detector: OnsetDetector,
        channels: DetectorChannels,
        commands: Consumer<DetectorCommand>,
        links: DetectorLinks,
    ) -> Self {
        Self {
            detector,
            channels,
            commands,
            links,
            reported_capture_overruns: 0,
            total_dropped: 0,
        }
    }

    pub fn detector(&self) -> &OnsetDetector {
        &self.detector
    }

    /// Stale blocks recycled without analysis since start
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Handle everything pending without blocking.
    pub fn service(&mut self) -> ServiceReport {
        let mut report = ServiceReport::default();

        while let Ok(command) = self.commands.pop() {
            report.commands += 1;
            if self.detector.handle_command(command) {
                self.links.sync_wake.evaluate();
            }
        }

        let mut newest: Option<SampleBlock> = None;
        while let Ok(block) = self.channels.data_consumer.pop() {
            if let Some(stale) = newest.replace(block) {
                self.recycle(stale);
                report.dropped_blocks += 1;
            }
        }

        if report.dropped_blocks > 0 {
            self.total_dropped += report.dropped_blocks as u64;
            tracing::warn!(
                "[DetectorWorker] Sampling overrun, dropped {} stale block(s)",
                report.dropped_blocks
            );
            self.links
                .telemetry
                .record_overrun(report.dropped_blocks as u64);
        }

        let capture_overruns = self.links.capture_overruns.load(Ordering::Relaxed);
        if capture_overruns > self.reported_capture_overruns {
            let missed = capture_overruns - self.reported_capture_overruns;
            self.reported_capture_overruns = capture_overruns;
            tracing::warn!(
                "[DetectorWorker] Capture side dropped {} block(s), queue full",
                missed
            );
            self.links.telemetry.record_overrun(missed);
        }

        if let Some(block) = newest {
            self.detector.set_config(&self.links.tunables.detector());
            report.onsets = self.detector.process_block(&block);
            report.processed_blocks = 1;
            self.recycle(block);
        }

        report
    }

    fn recycle(&mut self, block: SampleBlock) {
        // Both queues hold the whole pool, so this only fails if blocks were added
        if self.channels.pool_producer.push(block).is_err() {
            tracing::error!("[DetectorWorker] Pool queue full, block discarded");
        }
    }

    fn run(mut self, shutdown: Arc<AtomicBool>) {
        tracing::info!("[DetectorWorker] Thread started");
        while !shutdown.load(Ordering::Acquire) {
            if self.service().is_idle() {
                thread::park();
            }
        }
        tracing::info!(
            "[DetectorWorker] Thread exiting, {} stale block(s) dropped in total",
            self.total_dropped
        );
    }
}

/// Owner's handle on the detector thread
pub struct DetectorHandle {
    join: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    waker: DetectorWaker,
}

impl DetectorHandle {
    pub fn waker(&self) -> DetectorWaker {
        self.waker.clone()
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("[DetectorWorker] Thread panicked");
            }
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the detector thread; the mailbox goes to the clock.
pub fn spawn_detector_thread(
    detector: OnsetDetector,
    channels: DetectorChannels,
    links: DetectorLinks,
) -> (DetectorHandle, DetectorMailbox) {
    let (producer, consumer) = command_queue();
    let worker = DetectorWorker::new(detector, channels, consumer, links);
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let join = thread::spawn(move || worker.run(flag));
    let waker = DetectorWaker::new(join.thread().clone());

    (
        DetectorHandle {
            join: Some(join),
            shutdown,
            waker: waker.clone(),
        },
        DetectorMailbox::new(producer, waker),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer_pool::{BufferPool, CaptureChannels};
    use crate::config::AppConfig;
    use crate::indicators::NullIndicators;
    use crate::onset::OnsetLog;
    use crate::state::SharedBeatState;
    use crate::telemetry::DiagnosticEvent;
    use crate::tracking::EvaluatorSignal;

    struct Rig {
        worker: DetectorWorker,
        capture: CaptureChannels,
        commands: Producer<DetectorCommand>,
        log: Arc<OnsetLog>,
        telemetry: Arc<TelemetryHub>,
        sync_listener: crate::tracking::WakeListener,
    }

    fn rig() -> Rig {
        let (capture, channels) = BufferPool::new(4, 4).split();
        let log = Arc::new(OnsetLog::new());
        let telemetry = Arc::new(TelemetryHub::default());
        let (sync_wake, sync_listener) = EvaluatorWake::channel();
        let detector = OnsetDetector::new(
            &AppConfig::default().detector,
            Arc::clone(&log),
            SharedBeatState::new(250_000),
            Arc::new(NullIndicators),
            Arc::clone(&telemetry),
        );
        let (producer, consumer) = command_queue();
        let links = DetectorLinks {
            sync_wake,
            tunables: Tunables::default(),
            telemetry: Arc::clone(&telemetry),
            capture_overruns: Arc::new(AtomicU64::new(0)),
        };
        Rig {
            worker: DetectorWorker::new(detector, channels, consumer, links),
            capture,
            commands: producer,
            log,
            telemetry,
            sync_listener,
        }
    }

    fn push_block(capture: &mut CaptureChannels, start: i64, frames: Vec<[u16; 2]>) {
        let mut block = capture.pool_consumer.pop().expect("free block");
        block.reset(start, 1_000.0);
        block.frames.extend(frames);
        capture.data_producer.push(block).expect("data queue has room");
    }

    #[test]
    fn test_idle_service_does_nothing() {
        let mut rig = rig();
        assert!(rig.worker.service().is_idle());
    }

    #[test]
    fn test_only_newest_block_is_processed() {
        let mut rig = rig();
        rig.commands.push(DetectorCommand::Allow).unwrap();
        push_block(&mut rig.capture, 0, vec![[0, 0], [4_000, 0]]);
        push_block(&mut rig.capture, 10_000, vec![[0, 0], [0, 4_000]]);

        let report = rig.worker.service();
        assert_eq!(report.commands, 1);
        assert_eq!(report.processed_blocks, 1);
        assert_eq!(report.dropped_blocks, 1);
        assert_eq!(report.onsets, 1);

        let onset = rig.log.get(0).expect("onset from newest block");
        assert_eq!(onset.instrument, crate::onset::Instrument::Snare);
        assert_eq!(onset.timestamp_us, 11_000);
        assert_eq!(rig.telemetry.overrun_count(), 1);

        // Both blocks are back in the pool
        let mut free = 0;
        while rig.capture.pool_consumer.pop().is_ok() {
            free += 1;
        }
        assert_eq!(free, 4);
    }

    #[test]
    fn test_window_close_wakes_sync() {
        let mut rig = rig();
        rig.commands.push(DetectorCommand::Allow).unwrap();
        rig.commands
            .push(DetectorCommand::DisallowAndStartSync)
            .unwrap();
        rig.worker.service();
        assert_eq!(rig.sync_listener.take(), vec![EvaluatorSignal::Evaluate]);
        assert!(!rig.worker.detector().logging_allowed());
    }

    #[test]
    fn test_capture_overruns_reported_once() {
        let mut rig = rig();
        rig.worker.links.capture_overruns.store(3, Ordering::Relaxed);
        rig.worker.service();
        rig.worker.service();
        // The counter totals lost blocks; the burst is published once
        assert_eq!(rig.telemetry.overrun_count(), 3);
        assert_eq!(
            rig.telemetry.snapshot().recent,
            vec![DiagnosticEvent::SamplingOverrun { dropped_blocks: 3 }]
        );
    }

    #[test]
    fn test_thread_processes_and_shuts_down() {
        let (mut capture, channels) = BufferPool::new(4, 4).split();
        let log = Arc::new(OnsetLog::new());
        let telemetry = Arc::new(TelemetryHub::default());
        let (sync_wake, _listener) = EvaluatorWake::channel();
        let detector = OnsetDetector::new(
            &AppConfig::default().detector,
            Arc::clone(&log),
            SharedBeatState::new(250_000),
            Arc::new(NullIndicators),
            Arc::clone(&telemetry),
        );
        let links = DetectorLinks {
            sync_wake,
            tunables: Tunables::default(),
            telemetry,
            capture_overruns: Arc::new(AtomicU64::new(0)),
        };
        let (mut handle, mut mailbox) = spawn_detector_thread(detector, channels, links);
        assert!(mailbox.send(DetectorCommand::Allow));

        push_block(&mut capture, 0, vec![[0, 0], [4_000, 0]]);
        handle.waker().wake();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while log.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(1));
            handle.waker().wake();
        }
        assert_eq!(log.len(), 1);
        handle.shutdown();
    }
}
