//! Offline replay of a recorded performance.
//!
//! Runs the same detector, clock and evaluators as the live tracker, but on a
//! single thread in virtual time: clock deadlines are interleaved with the
//! recorded frames in timestamp order, window commands go straight to the
//! detector, and each window close runs one sync pass and one tempo pass at
//! the tick time. The result is deterministic for a given recording.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::capture::{f32_to_adc, i16_to_adc};
use crate::clock::{BeatClock, ClockCommand, ClockEffect, RecordingMidi, START, STOP, TIMING_CLOCK};
use crate::config::AppConfig;
use crate::engine::bpm_from_tau;
use crate::error::{ClockError, InputError};
use crate::indicators::{Indicators, NullIndicators};
use crate::onset::{DetectorCommand, OnsetDetector, OnsetEvent, OnsetLog};
use crate::state::{Micros, SharedBeatState};
use crate::telemetry::TelemetryHub;
use crate::tracking::{sync_pass, tempo_pass, LayerDecayRule, SyncController, TempoController};

/// Averaged two-channel detector frames at a fixed period.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub frame_period_us: f64,
    pub frames: Vec<[u16; 2]>,
}

impl Recording {
    pub fn new(frame_period_us: f64, frames: Vec<[u16; 2]>) -> Self {
        Self {
            frame_period_us,
            frames,
        }
    }

    /// Capture time of frame `index`
    pub fn frame_time(&self, index: usize) -> Micros {
        (index as f64 * self.frame_period_us).round() as Micros
    }

    pub fn duration_us(&self) -> Micros {
        self.frame_time(self.frames.len())
    }

    /// Load a WAV file with kick on channel 0 and snare on channel 1,
    /// averaging every `oversampling` frames as the live capture does.
    pub fn from_wav<P: AsRef<Path>>(path: P, oversampling: usize) -> Result<Self, InputError> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path).map_err(|err| InputError::StreamOpenFailed {
            reason: format!("failed to open {}: {}", path.display(), err),
        })?;
        let spec = reader.spec();
        if spec.channels < 2 {
            return Err(InputError::ChannelCountTooLow {
                channels: spec.channels,
            });
        }
        let read_error = |err: hound::Error| InputError::StreamOpenFailed {
            reason: format!("error reading {}: {}", path.display(), err),
        };

        let samples: Vec<u16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|sample| sample.map(f32_to_adc).map_err(read_error))
                .collect::<Result<_, _>>()?,
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|sample| sample.map(i16_to_adc).map_err(read_error))
                .collect::<Result<_, _>>()?,
            (hound::SampleFormat::Int, bits @ (24 | 32)) => reader
                .samples::<i32>()
                .map(|sample| {
                    sample
                        .map(|value| i16_to_adc((value >> (bits - 16)) as i16))
                        .map_err(read_error)
                })
                .collect::<Result<_, _>>()?,
            (format, bits) => {
                return Err(InputError::UnsupportedFormat {
                    format: format!("{:?} {}-bit", format, bits),
                })
            }
        };

        // Keep the first two channels of each interleaved frame
        let channels = spec.channels as usize;
        let stereo: Vec<u16> = samples
            .chunks_exact(channels)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect();
        let oversampling = oversampling.max(1);
        let frames = crate::onset::oversample_average(&stereo, oversampling);
        let frame_period_us = oversampling as f64 * 1_000_000.0 / spec.sample_rate.max(1) as f64;

        log::info!(
            "[Replay] Loaded {} ({} Hz, {} frames after {}x averaging)",
            path.display(),
            spec.sample_rate,
            frames.len(),
            oversampling
        );
        Ok(Self::new(frame_period_us, frames))
    }
}

/// One correction as it was handed to the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub at_us: Micros,
    pub correction_us: Micros,
}

/// Summary of a replay run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub frames: usize,
    pub duration_us: Micros,
    pub initial_tau_us: Micros,
    pub final_tau_us: Micros,
    pub initial_bpm: f64,
    pub final_bpm: f64,
    pub midi_bytes: usize,
    pub timing_clocks: usize,
    pub starts: usize,
    pub stops: usize,
    /// Time of every tick 0, one per 8th note
    pub eighth_times: Vec<Micros>,
    pub onsets: Vec<OnsetEvent>,
    pub sync_corrections: Vec<CorrectionRecord>,
    pub tempo_corrections: Vec<CorrectionRecord>,
    pub clamp_count: u64,
    pub aborted_scans: u64,
}

/// Single-threaded virtual-time tracker.
pub struct Replay {
    config: AppConfig,
    state: SharedBeatState,
    log: Arc<OnsetLog>,
    telemetry: Arc<TelemetryHub>,
    midi: RecordingMidi,
    detector: OnsetDetector,
    clock: BeatClock,
    sync: SyncController,
    tempo: TempoController,
    next_tick: Option<Micros>,
    logged: u64,
    report: ReplayReport,
}

impl Replay {
    pub fn new(config: AppConfig, decay_rule: LayerDecayRule) -> Result<Self, ClockError> {
        Self::with_indicators(config, decay_rule, Arc::new(NullIndicators))
    }

    pub fn with_indicators(
        config: AppConfig,
        decay_rule: LayerDecayRule,
        indicators: Arc<dyn Indicators>,
    ) -> Result<Self, ClockError> {
        config.validate()?;

        let tau = config.clock.default_tau_us;
        let state = SharedBeatState::new(tau);
        let log = Arc::new(OnsetLog::new());
        let telemetry = Arc::new(TelemetryHub::default());
        let midi = RecordingMidi::new();

        let detector = OnsetDetector::new(
            &config.detector,
            Arc::clone(&log),
            state.clone(),
            Arc::clone(&indicators),
            Arc::clone(&telemetry),
        );
        let clock = BeatClock::new(
            state.clone(),
            Box::new(midi.clone()),
            indicators,
            Arc::clone(&telemetry),
            config.clock.latency_smoothing,
        );
        let sync = SyncController::new(tau, &config.sync).with_decay_rule(decay_rule);
        let tempo = TempoController::new(tau, &config.tempo);

        Ok(Self {
            config,
            state,
            log,
            telemetry,
            midi,
            detector,
            clock,
            sync,
            tempo,
            next_tick: None,
            logged: 0,
            report: ReplayReport {
                initial_tau_us: tau,
                initial_bpm: bpm_from_tau(tau),
                ..ReplayReport::default()
            },
        })
    }

    pub fn state(&self) -> &SharedBeatState {
        &self.state
    }

    pub fn onset_log(&self) -> &OnsetLog {
        &self.log
    }

    pub fn telemetry(&self) -> &TelemetryHub {
        &self.telemetry
    }

    pub fn sync_controller(&self) -> &SyncController {
        &self.sync
    }

    pub fn tempo_controller(&self) -> &TempoController {
        &self.tempo
    }

    /// Start the clock at `tau` with tick 0 at `first_beat_at`.
    pub fn start(&mut self, tau: Micros, first_beat_at: Micros) -> Result<(), ClockError> {
        if tau <= 0 {
            return Err(ClockError::TauInvalid { tau_us: tau });
        }
        self.state.update(|state| state.tau = tau);
        self.sync.reset(tau, &self.config.sync);
        self.tempo.reset(tau, &self.config.tempo);
        self.report.initial_tau_us = tau;
        self.report.initial_bpm = bpm_from_tau(tau);

        let effect = self.clock.handle(ClockCommand::Start { at: first_beat_at });
        self.apply_effect(effect, first_beat_at);
        self.next_tick = effect.next_tick_at;
        Ok(())
    }

    pub fn stop(&mut self, at: Micros) {
        let effect = self.clock.handle(ClockCommand::Stop);
        self.apply_effect(effect, at);
        self.next_tick = None;
    }

    /// Run every clock tick due at or before `until`
    pub fn advance_to(&mut self, until: Micros) {
        while let Some(deadline) = self.next_tick.filter(|&deadline| deadline <= until) {
            if self.clock.tick() == 0 {
                self.report.eighth_times.push(deadline);
            }
            let effect = self.clock.on_tick(deadline);
            self.next_tick = effect.next_tick_at;
            self.apply_effect(effect, deadline);
        }
    }

    /// Feed one averaged frame captured at `at`, running due ticks first.
    pub fn feed_frame(&mut self, frame: [u16; 2], at: Micros) {
        self.advance_to(at);
        if self.detector.process_frame(frame, at) > 0 {
            let len = self.log.len();
            self.report
                .onsets
                .extend(self.log.range(self.logged, len).map(|(_, event)| event));
            self.logged = len;
        }
    }

    fn apply_effect(&mut self, effect: ClockEffect, now: Micros) {
        let Some(command) = effect.detector else {
            return;
        };
        if !self.detector.handle_command(command) {
            return;
        }
        debug_assert_eq!(command, DetectorCommand::DisallowAndStartSync);

        if let Some(correction) = sync_pass(
            &mut self.sync,
            &self.state,
            &self.log,
            &self.config.sync,
            &self.telemetry,
        ) {
            self.report.sync_corrections.push(CorrectionRecord {
                at_us: now,
                correction_us: correction,
            });
            self.clock.handle(ClockCommand::SetSyncCorrection(correction));
        }
        if let Some(correction) = tempo_pass(
            &mut self.tempo,
            &self.state,
            &self.log,
            &self.config.tempo,
            &self.telemetry,
            now,
        ) {
            self.report.tempo_corrections.push(CorrectionRecord {
                at_us: now,
                correction_us: correction,
            });
            self.clock.handle(ClockCommand::SetTempoCorrection(correction));
        }
    }

    /// Stop the clock if it is still running and summarise the run.
    pub fn finish(mut self, at: Micros) -> ReplayReport {
        if self.clock.is_running() {
            self.stop(at);
        }
        let final_tau = self.state.snapshot().tau;
        let bytes = self.midi.bytes();
        ReplayReport {
            duration_us: at,
            final_tau_us: final_tau,
            final_bpm: bpm_from_tau(final_tau),
            midi_bytes: bytes.len(),
            timing_clocks: bytes.iter().filter(|&&byte| byte == TIMING_CLOCK).count(),
            starts: bytes.iter().filter(|&&byte| byte == START).count(),
            stops: bytes.iter().filter(|&&byte| byte == STOP).count(),
            clamp_count: self.telemetry.clamp_count(),
            aborted_scans: self.telemetry.aborted_scans(),
            ..self.report
        }
    }
}

/// Replay `recording` with the clock started at `tau` and tick 0 at `first_beat_at`.
pub fn replay_recording(
    recording: &Recording,
    config: AppConfig,
    decay_rule: LayerDecayRule,
    tau: Micros,
    first_beat_at: Micros,
) -> Result<ReplayReport, ClockError> {
    let mut replay = Replay::new(config, decay_rule)?;
    replay.start(tau, first_beat_at)?;
    for (index, frame) in recording.frames.iter().enumerate() {
        replay.feed_frame(*frame, recording.frame_time(index));
    }
    let end = recording.duration_us();
    replay.advance_to(end);

    let mut report = replay.finish(end);
    report.frames = recording.frames.len();
    log::info!(
        "[Replay] {} onsets, {} sync / {} tempo corrections, {:.1} -> {:.1} BPM",
        report.onsets.len(),
        report.sync_corrections.len(),
        report.tempo_corrections.len(),
        report.initial_bpm,
        report.final_bpm
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: f64 = 1_000.0 / 6.0;

    /// Silent recording with a short spike on `channel` at each time
    fn spikes(duration_us: Micros, hits: &[(Micros, usize)]) -> Recording {
        let len = (duration_us as f64 / PERIOD) as usize;
        let mut frames = vec![[0u16; 2]; len];
        for &(at, channel) in hits {
            let start = (at as f64 / PERIOD).ceil() as usize;
            for frame in frames.iter_mut().skip(start).take(3) {
                frame[channel] = 3_000;
            }
        }
        Recording::new(PERIOD, frames)
    }

    #[test]
    fn test_silent_replay_keeps_tempo() {
        let recording = spikes(2_000_000, &[]);
        let report = replay_recording(
            &recording,
            AppConfig::default(),
            LayerDecayRule::Equal,
            250_000,
            100_000,
        )
        .unwrap();

        assert_eq!(report.starts, 1);
        assert_eq!(report.stops, 1);
        assert_eq!(report.final_tau_us, 250_000);
        assert!(report.onsets.is_empty());
        assert!(report.sync_corrections.is_empty());
        assert!(report.tempo_corrections.is_empty());
        // 1.9 s of clock at 250 ms per 8th
        assert_eq!(report.eighth_times.len(), 8);
        assert_eq!(report.eighth_times[0], 100_000);
        let clocks = report.timing_clocks;
        assert!((8 * 12 - 12..=8 * 12).contains(&clocks), "{} clocks", clocks);
    }

    #[test]
    fn test_late_hits_pull_the_phase() {
        // Every quarter note lands 2 ms behind the clock
        let hits: Vec<(Micros, usize)> = (0..8)
            .map(|beat| (100_000 + beat * 500_000 + 2_000, 0))
            .collect();
        let recording = spikes(4_000_000, &hits);
        let report = replay_recording(
            &recording,
            AppConfig::default(),
            LayerDecayRule::Equal,
            250_000,
            100_000,
        )
        .unwrap();

        assert!(report.onsets.len() >= 6);
        assert!(!report.sync_corrections.is_empty());
        assert!(report.sync_corrections[0].correction_us > 0);
    }

    #[test]
    fn test_report_serializes() {
        let report = replay_recording(
            &spikes(600_000, &[(100_000, 1)]),
            AppConfig::default(),
            LayerDecayRule::Equal,
            250_000,
            100_000,
        )
        .unwrap();
        let json = serde_json::to_string(&report).unwrap();
        let back: ReplayReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert_eq!(report.onsets.len(), 1);
    }

    #[test]
    fn test_invalid_tau_rejected() {
        let mut replay = Replay::new(AppConfig::default(), LayerDecayRule::Equal).unwrap();
        assert_eq!(
            replay.start(0, 0),
            Err(ClockError::TauInvalid { tau_us: 0 })
        );
    }
}
