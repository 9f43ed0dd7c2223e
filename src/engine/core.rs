//! BeatTracker: live orchestration of the tracking threads.
//!
//! Owns the shared beat state, the onset log and the live tunables, and the
//! three worker threads wired together at construction:
//!
//! ```text
//! capture ──blocks──▶ detector ──wake──▶ sync ──wake──▶ tempo
//!                        ▲                 │              │
//!                        └──window cmds── clock ◀─corrections┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::{BlockAssembler, BufferPool, CaptureChannels, InputCapture};
use crate::clock::{spawn_clock_thread, BeatClock, ClockCommand, ClockHandle, MidiSink};
use crate::config::{AppConfig, ParamPatch, Tunables};
use crate::error::{ClockError, InputError};
use crate::indicators::{Indicators, LogIndicators};
use crate::onset::{spawn_detector_thread, DetectorHandle, DetectorLinks, OnsetDetector, OnsetLog};
use crate::state::{BeatSnapshot, Micros, SharedBeatState};
use crate::telemetry::{self, TelemetryHub};
use crate::timing::{Clock, SystemClock};
use crate::tracking::{
    spawn_evaluator_thread, EvaluatorHandle, EvaluatorLinks, EvaluatorWake, LayerDecayRule,
};

/// Microseconds per minute
const US_PER_MINUTE: f64 = 60_000_000.0;

/// Quarter-note tempo for an 8th-note duration
pub fn bpm_from_tau(tau: Micros) -> f64 {
    US_PER_MINUTE / (2.0 * tau.max(1) as f64)
}

/// 8th-note duration for a quarter-note tempo
pub fn tau_from_bpm(bpm: f64) -> Micros {
    (US_PER_MINUTE / (2.0 * bpm.max(1.0))).round() as Micros
}

/// Outputs and time source the tracker runs against
pub struct TrackerIo {
    pub midi: Box<dyn MidiSink>,
    pub indicators: Arc<dyn Indicators>,
    pub time: Arc<dyn Clock>,
    pub telemetry: Arc<TelemetryHub>,
    pub decay_rule: LayerDecayRule,
}

impl TrackerIo {
    /// System clock, log indicators and the global telemetry hub
    pub fn new(midi: Box<dyn MidiSink>) -> Self {
        Self {
            midi,
            indicators: Arc::new(LogIndicators),
            time: Arc::new(SystemClock::new()),
            telemetry: telemetry::hub(),
            decay_rule: LayerDecayRule::default(),
        }
    }
}

/// Running tracker. Dropping it stops every thread.
pub struct BeatTracker {
    tunables: Tunables,
    state: SharedBeatState,
    log: Arc<OnsetLog>,
    time: Arc<dyn Clock>,
    telemetry: Arc<TelemetryHub>,
    capture: Option<CaptureChannels>,
    capture_overruns: Arc<AtomicU64>,
    performing: AtomicBool,
    // Field order is shutdown order: clock first so the detector sees the final Disallow
    clock: ClockHandle,
    evaluators: EvaluatorHandle,
    detector: DetectorHandle,
}

impl BeatTracker {
    /// Validate `config` and spawn the detector, evaluator and clock threads.
    pub fn start(config: AppConfig, io: TrackerIo) -> Result<Self, ClockError> {
        if let Err(err) = config.validate() {
            log::error!("[BeatTracker] Invalid configuration: {}", err);
            return Err(err.into());
        }

        let tunables = Tunables::new(config.clone());
        let state = SharedBeatState::new(config.clock.default_tau_us);
        let log = Arc::new(OnsetLog::new());
        let capture_overruns = Arc::new(AtomicU64::new(0));
        let (capture, detector_channels) =
            BufferPool::new(config.audio.buffer_count, config.audio.block_frames).split();

        let (sync_wake, sync_listener) = EvaluatorWake::channel();

        let detector = OnsetDetector::new(
            &config.detector,
            Arc::clone(&log),
            state.clone(),
            Arc::clone(&io.indicators),
            Arc::clone(&io.telemetry),
        );
        let (detector_handle, mailbox) = spawn_detector_thread(
            detector,
            detector_channels,
            DetectorLinks {
                sync_wake: sync_wake.clone(),
                tunables: tunables.clone(),
                telemetry: Arc::clone(&io.telemetry),
                capture_overruns: Arc::clone(&capture_overruns),
            },
        );

        let beat_clock = BeatClock::new(
            state.clone(),
            io.midi,
            Arc::clone(&io.indicators),
            Arc::clone(&io.telemetry),
            config.clock.latency_smoothing,
        );
        let clock = spawn_clock_thread(
            beat_clock,
            mailbox,
            tunables.clone(),
            Arc::clone(&io.time),
        );

        let evaluators = spawn_evaluator_thread(
            (sync_wake, sync_listener),
            EvaluatorLinks {
                state: state.clone(),
                log: Arc::clone(&log),
                tunables: tunables.clone(),
                clock: clock.sender(),
                time: Arc::clone(&io.time),
                telemetry: Arc::clone(&io.telemetry),
                decay_rule: io.decay_rule,
            },
        )?;

        log::info!(
            "[BeatTracker] Started, default tempo {:.1} BPM",
            bpm_from_tau(config.clock.default_tau_us)
        );

        Ok(Self {
            tunables,
            state,
            log,
            time: io.time,
            telemetry: io.telemetry,
            capture: Some(capture),
            capture_overruns,
            performing: AtomicBool::new(false),
            clock,
            evaluators,
            detector: detector_handle,
        })
    }

    /// Begin a performance at `tau` with the first beat (tick 0) at `first_beat_at`.
    ///
    /// Tap-tempo style bootstrapping happens outside the tracker.
    pub fn begin_performance(&self, tau: Micros, first_beat_at: Micros) -> Result<(), ClockError> {
        if tau <= 0 {
            return Err(ClockError::TauInvalid { tau_us: tau });
        }
        if self.performing.swap(true, Ordering::SeqCst) {
            return Err(ClockError::AlreadyRunning);
        }

        self.state.update(|state| state.tau = tau);
        self.evaluators.reset(tau);
        if let Err(err) = self.clock.send(ClockCommand::Start { at: first_beat_at }) {
            self.performing.store(false, Ordering::SeqCst);
            return Err(err);
        }
        log::info!(
            "[BeatTracker] Performance started at {:.1} BPM, first beat at {} us",
            bpm_from_tau(tau),
            first_beat_at
        );
        Ok(())
    }

    pub fn stop_performance(&self) -> Result<(), ClockError> {
        if !self.performing.swap(false, Ordering::SeqCst) {
            return Err(ClockError::NotRunning);
        }
        self.clock.send(ClockCommand::Stop)?;
        log::info!("[BeatTracker] Performance stopped");
        Ok(())
    }

    pub fn is_performing(&self) -> bool {
        self.performing.load(Ordering::SeqCst)
    }

    /// Update the live tunables
    pub fn apply_patch(&self, patch: &ParamPatch) {
        self.tunables.apply_patch(patch);
    }

    pub fn config(&self) -> AppConfig {
        self.tunables.current()
    }

    pub fn snapshot(&self) -> BeatSnapshot {
        self.state.snapshot()
    }

    pub fn bpm(&self) -> f64 {
        bpm_from_tau(self.state.snapshot().tau)
    }

    pub fn onset_log(&self) -> Arc<OnsetLog> {
        Arc::clone(&self.log)
    }

    pub fn telemetry(&self) -> Arc<TelemetryHub> {
        Arc::clone(&self.telemetry)
    }

    pub fn now_us(&self) -> Micros {
        self.time.now_us()
    }

    /// Producer side of the sample pool. Available once.
    pub fn take_block_assembler(&mut self) -> Option<BlockAssembler> {
        let channels = self.capture.take()?;
        Some(BlockAssembler::new(
            channels,
            self.detector.waker(),
            Arc::clone(&self.capture_overruns),
            &self.tunables.current().audio,
        ))
    }

    /// Open the live input device and stream it into the detector
    pub fn open_input(&mut self, device_filter: Option<&str>) -> Result<InputCapture, InputError> {
        let channels = self.capture.take().ok_or_else(|| InputError::StreamOpenFailed {
            reason: "input already attached".to_string(),
        })?;
        InputCapture::open(
            device_filter,
            &self.tunables.current().audio,
            channels,
            self.detector.waker(),
            Arc::clone(&self.capture_overruns),
            Arc::clone(&self.time),
        )
    }

    /// Stop every thread (sending STOP if a performance is running)
    pub fn shutdown(mut self) {
        self.clock.shutdown();
        self.evaluators.shutdown();
        self.detector.shutdown();
        self.performing.store(false, Ordering::SeqCst);
        log::info!("[BeatTracker] Shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tempo_conversions() {
        assert_eq!(tau_from_bpm(120.0), 250_000);
        assert_eq!(bpm_from_tau(250_000), 120.0);
        assert_eq!(tau_from_bpm(90.0), 333_333);
        assert!((bpm_from_tau(tau_from_bpm(137.0)) - 137.0).abs() < 0.01);
    }
}
