// Onset detector - envelope follower with slope threshold per drum channel
//
// Each channel keeps a peak-hold envelope that decays linearly between hits:
//
//   env = sample                 if sample > env
//   env = max(0, env - decay)    otherwise
//
// An onset is a rise of the envelope by more than `slope_threshold` over the
// last `slope_window` frames, outside the retrigger gate of the previous onset.
// Onsets are appended to the OnsetLog only while the clock keeps the logging
// window open; the gate and the indicator flash run regardless.

use std::sync::Arc;

use crate::audio::buffer_pool::SampleBlock;
use crate::config::{ChannelFilterConfig, DetectorConfig, MAX_SLOPE_WINDOW};
use crate::indicators::Indicators;
use crate::onset::log::{Instrument, OnsetEvent, OnsetLog};
use crate::state::{Micros, SharedBeatState};
use crate::telemetry::TelemetryHub;

/// Averaged samples above this value count as clipping in the gain check
pub const GAIN_CLIP_VALUE: u16 = 4094;

/// Logging-window and mode commands sent to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorCommand {
    /// Open the logging window for the next beat
    Allow,
    /// Close the logging window
    Disallow,
    /// Close the logging window and hand the beat to the sync evaluator
    DisallowAndStartSync,
    /// Drive the indicators with clip status instead of onsets
    StartGainCheck,
    StopGainCheck,
}

/// Average interleaved oversampled `[kick, snare, kick, snare, ...]` input.
///
/// Every `factor` consecutive frames collapse into one. A trailing partial
/// group is dropped.
pub fn oversample_average(raw: &[u16], factor: usize) -> Vec<[u16; 2]> {
    let factor = factor.max(1);
    raw.chunks_exact(2 * factor)
        .map(|group| {
            let mut sums = [0u32; 2];
            for frame in group.chunks_exact(2) {
                sums[0] += frame[0] as u32;
                sums[1] += frame[1] as u32;
            }
            [
                (sums[0] / factor as u32) as u16,
                (sums[1] / factor as u32) as u16,
            ]
        })
        .collect()
}

/// Envelope follower and slope trigger for one channel
#[derive(Debug, Clone)]
pub struct ChannelDetector {
    instrument: Instrument,
    config: ChannelFilterConfig,
    envelope: i32,
    history: Box<[i32]>,
    head: usize,
    last_onset: Option<Micros>,
}

impl ChannelDetector {
    pub fn new(instrument: Instrument, config: ChannelFilterConfig) -> Self {
        let mut detector = Self {
            instrument,
            config,
            envelope: 0,
            history: vec![0; MAX_SLOPE_WINDOW].into_boxed_slice(),
            head: 0,
            last_onset: None,
        };
        detector.set_config(config);
        detector
    }

    pub fn instrument(&self) -> Instrument {
        self.instrument
    }

    pub fn config(&self) -> &ChannelFilterConfig {
        &self.config
    }

    /// Swap in new filter parameters. History and gate state are kept.
    pub fn set_config(&mut self, config: ChannelFilterConfig) {
        self.config = ChannelFilterConfig {
            slope_window: config.slope_window.clamp(1, MAX_SLOPE_WINDOW - 1),
            gate_us: config.gate_us.max(0),
            ..config
        };
    }

    pub fn envelope(&self) -> i32 {
        self.envelope
    }

    pub fn last_onset(&self) -> Option<Micros> {
        self.last_onset
    }

    /// Feed one averaged sample taken at `now`; true if it is an onset.
    pub fn process(&mut self, sample: u16, now: Micros) -> bool {
        let sample = sample as i32;
        self.envelope = if sample > self.envelope {
            sample
        } else {
            (self.envelope - self.config.decay as i32).max(0)
        };

        let len = self.history.len();
        let past = self.history[(self.head + len - self.config.slope_window) % len];
        self.history[self.head] = self.envelope;
        self.head = (self.head + 1) % len;

        let slope = self.envelope - past;
        if slope <= self.config.slope_threshold {
            return false;
        }
        if let Some(last) = self.last_onset {
            if now <= last + self.config.gate_us {
                return false;
            }
        }
        self.last_onset = Some(now);
        true
    }
}

/// Two-channel onset detector feeding the shared onset log.
pub struct OnsetDetector {
    channels: [ChannelDetector; 2],
    log: Arc<OnsetLog>,
    state: SharedBeatState,
    indicators: Arc<dyn Indicators>,
    telemetry: Arc<TelemetryHub>,
    logging_allowed: bool,
    onset_latch: bool,
    gain_check: bool,
}

impl OnsetDetector {
    pub fn new(
        config: &DetectorConfig,
        log: Arc<OnsetLog>,
        state: SharedBeatState,
        indicators: Arc<dyn Indicators>,
        telemetry: Arc<TelemetryHub>,
    ) -> Self {
        Self {
            channels: [
                ChannelDetector::new(Instrument::Kick, config.kick),
                ChannelDetector::new(Instrument::Snare, config.snare),
            ],
            log,
            state,
            indicators,
            telemetry,
            logging_allowed: false,
            onset_latch: false,
            gain_check: false,
        }
    }

    pub fn set_config(&mut self, config: &DetectorConfig) {
        self.channels[0].set_config(config.kick);
        self.channels[1].set_config(config.snare);
    }

    pub fn channel(&self, instrument: Instrument) -> &ChannelDetector {
        &self.channels[instrument.index()]
    }

    pub fn logging_allowed(&self) -> bool {
        self.logging_allowed
    }

    pub fn gain_check_active(&self) -> bool {
        self.gain_check
    }

    /// Apply a command from the clock.
    ///
    /// Returns true when the sync evaluator must be woken.
    pub fn handle_command(&mut self, command: DetectorCommand) -> bool {
        match command {
            DetectorCommand::Allow => {
                let next_seq = self.log.len();
                self.state.update(|state| {
                    state.sync_cursor = next_seq;
                    state.onset_observed = false;
                });
                self.onset_latch = false;
                self.logging_allowed = true;
                self.gain_check = false;
                false
            }
            DetectorCommand::Disallow => {
                self.logging_allowed = false;
                self.gain_check = false;
                false
            }
            DetectorCommand::DisallowAndStartSync => {
                self.logging_allowed = false;
                self.gain_check = false;
                let observed = self.onset_latch;
                self.state.update(|state| state.onset_observed = observed);
                true
            }
            DetectorCommand::StartGainCheck => {
                self.gain_check = true;
                false
            }
            DetectorCommand::StopGainCheck => {
                self.gain_check = false;
                false
            }
        }
    }

    /// Process one averaged frame captured at `now`; returns onsets logged.
    pub fn process_frame(&mut self, frame: [u16; 2], now: Micros) -> usize {
        if self.gain_check {
            for instrument in Instrument::ALL {
                self.indicators
                    .clip_status(instrument, frame[instrument.index()] > GAIN_CLIP_VALUE);
            }
        }

        let mut logged = 0;
        for instrument in Instrument::ALL {
            let index = instrument.index();
            if !self.channels[index].process(frame[index], now) {
                continue;
            }
            if self.logging_allowed {
                self.log_onset(OnsetEvent {
                    timestamp_us: now,
                    instrument,
                });
                logged += 1;
            }
            if !self.gain_check {
                self.indicators.onset_flash(instrument);
            }
        }
        logged
    }

    /// Process every frame of a block; returns onsets logged.
    pub fn process_block(&mut self, block: &SampleBlock) -> usize {
        block
            .frames
            .iter()
            .enumerate()
            .map(|(i, frame)| self.process_frame(*frame, block.frame_time(i)))
            .sum()
    }

    fn log_onset(&mut self, event: OnsetEvent) {
        // Publish in the log before advancing the shared newest index
        let seq = self.log.push(event);
        self.state.update(|state| state.newest_onset = Some(seq));
        self.onset_latch = true;
        self.telemetry
            .record_onset(event.instrument, event.timestamp_us);
        tracing::debug!(
            "[OnsetDetector] {:?} onset #{} at {} us",
            event.instrument,
            seq,
            event.timestamp_us
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{IndicatorEvent, RecordingIndicators};

    const FRAME_US: Micros = 167;

    fn detector() -> (OnsetDetector, Arc<OnsetLog>, SharedBeatState, Arc<RecordingIndicators>) {
        let log = Arc::new(OnsetLog::new());
        let state = SharedBeatState::new(250_000);
        let indicators = Arc::new(RecordingIndicators::new());
        let detector = OnsetDetector::new(
            &DetectorConfig::default(),
            Arc::clone(&log),
            state.clone(),
            indicators.clone(),
            Arc::new(TelemetryHub::default()),
        );
        (detector, log, state, indicators)
    }

    #[test]
    fn test_envelope_peak_hold_and_decay() {
        let mut channel = ChannelDetector::new(Instrument::Kick, ChannelFilterConfig::default());
        channel.process(1000, 0);
        assert_eq!(channel.envelope(), 1000);
        channel.process(0, 1);
        assert_eq!(channel.envelope(), 980);
        channel.process(990, 2);
        assert_eq!(channel.envelope(), 990);

        let mut quiet = ChannelDetector::new(Instrument::Kick, ChannelFilterConfig::default());
        quiet.process(10, 0);
        quiet.process(0, 1);
        assert_eq!(quiet.envelope(), 0, "envelope floors at zero");
    }

    #[test]
    fn test_slope_threshold_and_gate() {
        let mut channel = ChannelDetector::new(Instrument::Snare, ChannelFilterConfig::default());
        assert!(!channel.process(100, 0), "rise of exactly the threshold is not an onset");

        let mut channel = ChannelDetector::new(Instrument::Snare, ChannelFilterConfig::default());
        assert!(channel.process(2000, 1_000));
        assert_eq!(channel.last_onset(), Some(1_000));

        // Let the envelope fall back, then hit again inside the gate
        for i in 0..200 {
            channel.process(0, 1_000 + i * FRAME_US);
        }
        assert_eq!(channel.envelope(), 0);
        assert!(!channel.process(2000, 150_000));
        for i in 0..200 {
            channel.process(0, 150_000 + i * FRAME_US);
        }
        assert!(channel.process(2000, 250_000));
    }

    #[test]
    fn test_slope_uses_window_ago_value() {
        let config = ChannelFilterConfig {
            decay: 0,
            slope_threshold: 50,
            slope_window: 3,
            gate_us: 0,
        };
        let mut channel = ChannelDetector::new(Instrument::Kick, config);
        // Slow ramp: never rises more than 50 across 3 frames
        for (i, sample) in [10u16, 20, 30, 40, 50, 60, 70].iter().enumerate() {
            assert!(!channel.process(*sample, i as Micros));
        }
        // Jump of 61 relative to three frames ago
        assert!(channel.process(111, 10));
    }

    #[test]
    fn test_onsets_logged_only_while_allowed() {
        let (mut detector, log, state, indicators) = detector();

        assert_eq!(detector.process_frame([3000, 0], 10), 0);
        assert!(log.is_empty());
        assert_eq!(
            indicators.events(),
            vec![IndicatorEvent::OnsetFlash(Instrument::Kick)],
            "the flash runs even with logging closed"
        );
        // The gate was armed by the unlogged hit
        assert_eq!(detector.channel(Instrument::Kick).last_onset(), Some(10));

        detector.handle_command(DetectorCommand::Allow);
        // The kick envelope is still falling but inside its gate
        assert_eq!(detector.process_frame([0, 3000], 100_000), 1);
        assert_eq!(log.len(), 1);
        let event = log.get(0).unwrap();
        assert_eq!(event.instrument, Instrument::Snare);
        assert_eq!(event.timestamp_us, 100_000);
        assert_eq!(state.snapshot().newest_onset, Some(0));
    }

    #[test]
    fn test_window_commands_drive_latch_and_cursor() {
        let (mut detector, log, state, _) = detector();

        assert!(!detector.handle_command(DetectorCommand::Allow));
        assert!(detector.logging_allowed());
        detector.process_frame([3000, 3000], 1_000);
        assert_eq!(log.len(), 2);

        assert!(detector.handle_command(DetectorCommand::DisallowAndStartSync));
        assert!(!detector.logging_allowed());
        let snapshot = state.snapshot();
        assert!(snapshot.onset_observed);
        assert_eq!(snapshot.sync_cursor, 0);
        assert_eq!(snapshot.newest_onset, Some(1));

        detector.handle_command(DetectorCommand::Allow);
        let snapshot = state.snapshot();
        assert!(!snapshot.onset_observed);
        assert_eq!(snapshot.sync_cursor, 2);

        // Nothing detected in this window
        assert!(detector.handle_command(DetectorCommand::DisallowAndStartSync));
        assert!(!state.snapshot().onset_observed);

        assert!(!detector.handle_command(DetectorCommand::Disallow));
        assert!(!detector.logging_allowed());
    }

    #[test]
    fn test_gain_check_reports_clipping() {
        let (mut detector, _, _, indicators) = detector();
        detector.handle_command(DetectorCommand::StartGainCheck);
        assert!(detector.gain_check_active());
        detector.process_frame([4095, 10], 0);

        let events = indicators.events();
        assert!(events.contains(&IndicatorEvent::Clip(Instrument::Kick, true)));
        assert!(events.contains(&IndicatorEvent::Clip(Instrument::Snare, false)));
        assert!(!events
            .iter()
            .any(|event| matches!(event, IndicatorEvent::OnsetFlash(_))));

        detector.handle_command(DetectorCommand::StopGainCheck);
        assert!(!detector.gain_check_active());
    }

    #[test]
    fn test_process_block_timestamps_frames() {
        let (mut detector, log, _, _) = detector();
        detector.handle_command(DetectorCommand::Allow);
        let mut frames = vec![[0u16, 0u16]; 10];
        frames[4] = [2500, 0];
        let block = SampleBlock::from_frames(1_000_000, 166.5, frames);
        assert_eq!(detector.process_block(&block), 1);
        assert_eq!(log.get(0).unwrap().timestamp_us, 1_000_000 + 666);
    }

    #[test]
    fn test_oversample_average() {
        let raw = [10, 100, 20, 200, 30, 300, 40, 400, 99, 99];
        let frames = oversample_average(&raw, 2);
        assert_eq!(frames, vec![[15, 150], [35, 350]]);
        assert_eq!(oversample_average(&raw[..4], 1), vec![[10, 100], [20, 200]]);
    }

    #[test]
    fn test_config_clamps_window() {
        let config = ChannelFilterConfig {
            slope_window: 5_000,
            ..ChannelFilterConfig::default()
        };
        let channel = ChannelDetector::new(Instrument::Kick, config);
        assert_eq!(channel.config().slope_window, MAX_SLOPE_WINDOW - 1);
    }
}
