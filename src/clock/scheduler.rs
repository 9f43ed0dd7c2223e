//! BeatClock - tick-level state machine of the MIDI clock
//!
//! Each 8th note is divided into 12 ticks (24 PPQN). The clock does no
//! sleeping of its own: `on_tick` performs the actions of one tick and
//! returns the deadline of the next, so the same machine runs under the
//! real-time `ClockRunner` and under offline replay.
//!
//! Tick actions:
//! - 0: spacing for the first half of the 8th (tau plus smoothed latency), accents
//! - 1: accents off
//! - 4: close the onset window and start the sync pass
//! - 6: spacing for the second half (absorbs the sync correction), next position
//! - 8: reopen the onset window

use std::sync::Arc;

use crate::indicators::Indicators;
use crate::onset::DetectorCommand;
use crate::state::{Micros, SharedBeatState, TWO_BAR_LENGTH};
use crate::telemetry::{ClampTarget, TelemetryHub};

use super::midi::{MidiSink, START, STOP, TIMING_CLOCK};

/// MIDI clock ticks per 8th note
pub const TICKS_PER_8TH: u8 = 12;

const ACCENT_TICK: u8 = 0;
const ACCENT_OFF_TICK: u8 = 1;
const WINDOW_CLOSE_TICK: u8 = 4;
const HALF_BEAT_TICK: u8 = 6;
const WINDOW_OPEN_TICK: u8 = 8;

/// Lowest value a correction may bring tau or a pending latency to,
/// relative to `tau` (`-0.8 * tau`)
pub fn correction_floor(tau: Micros) -> Micros {
    -(tau.max(1) * 4 / 5)
}

/// Integer division rounded to nearest (half up)
fn div_round(value: Micros, divisor: Micros) -> Micros {
    (value + divisor / 2).div_euclid(divisor)
}

/// Commands accepted by the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockCommand {
    /// Begin a performance with tick 0 at `at`
    Start { at: Micros },
    Stop,
    /// Phase correction for the next half period (latest wins)
    SetSyncCorrection(Micros),
    /// Tempo step applied to tau
    SetTempoCorrection(Micros),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRunState {
    Stopped,
    Running,
}

/// What the caller has to do after a command or tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockEffect {
    /// Command to forward to the onset detector
    pub detector: Option<DetectorCommand>,
    /// When `on_tick` must be called next (None while stopped)
    pub next_tick_at: Option<Micros>,
}

pub struct BeatClock {
    state: SharedBeatState,
    midi: Box<dyn MidiSink>,
    indicators: Arc<dyn Indicators>,
    telemetry: Arc<TelemetryHub>,
    run_state: ClockRunState,
    start_pending: bool,
    tick: u8,
    pending_sync: Micros,
    pending_latency: [Micros; TWO_BAR_LENGTH],
    tick_interval: Micros,
    latency_smoothing: u16,
}

impl BeatClock {
    pub fn new(
        state: SharedBeatState,
        midi: Box<dyn MidiSink>,
        indicators: Arc<dyn Indicators>,
        telemetry: Arc<TelemetryHub>,
        latency_smoothing: u16,
    ) -> Self {
        Self {
            state,
            midi,
            indicators,
            telemetry,
            run_state: ClockRunState::Stopped,
            start_pending: false,
            tick: 0,
            pending_sync: 0,
            pending_latency: [0; TWO_BAR_LENGTH],
            tick_interval: 1,
            latency_smoothing,
        }
    }

    pub fn run_state(&self) -> ClockRunState {
        self.run_state
    }

    pub fn is_running(&self) -> bool {
        self.run_state == ClockRunState::Running
    }

    /// Tick that the next `on_tick` call performs
    pub fn tick(&self) -> u8 {
        self.tick
    }

    pub fn tick_interval(&self) -> Micros {
        self.tick_interval
    }

    pub fn pending_sync(&self) -> Micros {
        self.pending_sync
    }

    pub fn pending_latency(&self) -> &[Micros; TWO_BAR_LENGTH] {
        &self.pending_latency
    }

    pub fn latency_smoothing(&self) -> u16 {
        self.latency_smoothing
    }

    pub fn set_latency_smoothing(&mut self, amount: u16) {
        self.latency_smoothing = amount;
    }

    pub fn handle(&mut self, command: ClockCommand) -> ClockEffect {
        match command {
            ClockCommand::Start { at } => self.start(at),
            ClockCommand::Stop => self.stop(),
            ClockCommand::SetSyncCorrection(delta) => {
                self.set_sync_correction(delta);
                ClockEffect::default()
            }
            ClockCommand::SetTempoCorrection(delta) => {
                self.apply_tempo_correction(delta);
                ClockEffect::default()
            }
        }
    }

    fn start(&mut self, at: Micros) -> ClockEffect {
        if self.is_running() {
            log::warn!("[BeatClock] Start while running, restarting at {} us", at);
        }
        self.tick = 0;
        self.pending_sync = 0;
        self.pending_latency = [0; TWO_BAR_LENGTH];
        self.tick_interval = 1;
        let tau = self.state.update(|state| {
            state.reset_for_performance();
            state.expected_beat = at;
            state.tau
        });
        self.run_state = ClockRunState::Running;
        self.start_pending = true;
        self.telemetry.record_clock_started(tau);
        log::info!("[BeatClock] Started, tau {} us, first beat at {} us", tau, at);

        ClockEffect {
            detector: Some(DetectorCommand::Allow),
            next_tick_at: Some(at),
        }
    }

    fn stop(&mut self) -> ClockEffect {
        if !self.is_running() {
            log::debug!("[BeatClock] Stop while already stopped");
            return ClockEffect::default();
        }
        self.run_state = ClockRunState::Stopped;
        self.start_pending = false;
        self.midi.send(STOP);
        self.indicators.accents_off();
        self.pending_sync = 0;
        self.pending_latency = [0; TWO_BAR_LENGTH];
        self.telemetry.record_clock_stopped();
        log::info!("[BeatClock] Stopped");

        ClockEffect {
            detector: Some(DetectorCommand::Disallow),
            next_tick_at: None,
        }
    }

    fn set_sync_correction(&mut self, delta: Micros) {
        if !self.is_running() {
            log::debug!("[BeatClock] Sync correction {} us ignored while stopped", delta);
            return;
        }
        let tau = self.state.snapshot().tau;
        let floor = correction_floor(tau / 2);
        if delta < floor {
            log::warn!(
                "[BeatClock] Sync correction {} us clamped to {} us",
                delta,
                floor
            );
            self.telemetry.record_clamp(ClampTarget::Sync, delta, floor);
            self.pending_sync = floor;
        } else {
            self.pending_sync = delta;
        }
    }

    fn apply_tempo_correction(&mut self, delta: Micros) {
        if !self.is_running() {
            log::debug!("[BeatClock] Tempo correction {} us ignored while stopped", delta);
            return;
        }
        let (tau, position) = {
            let snapshot = self.state.snapshot();
            (snapshot.tau, snapshot.bar_position)
        };

        let floor = correction_floor(tau);
        let applied = if delta < floor {
            log::warn!(
                "[BeatClock] Tempo correction {} us clamped to {} us",
                delta,
                floor
            );
            self.telemetry.record_clamp(ClampTarget::Tau, delta, floor);
            floor
        } else {
            delta
        };

        let new_tau = (tau + applied).max(1);
        self.state.update(|state| state.tau = new_tau);
        tracing::debug!("[BeatClock] tau {} -> {} us", tau, new_tau);

        let latency_floor = correction_floor(new_tau);
        let smoothing = self.latency_smoothing as usize;
        for j in 1..=smoothing {
            let slot = (position + j) % TWO_BAR_LENGTH;
            let weight = (smoothing + 1 - j) as Micros;
            self.pending_latency[slot] += applied * weight;
            self.clamp_latency(slot, latency_floor);
        }
        // A shorter tau lowers the floor for every position
        for slot in 0..TWO_BAR_LENGTH {
            self.clamp_latency(slot, latency_floor);
        }
    }

    fn clamp_latency(&mut self, slot: usize, floor: Micros) {
        let requested = self.pending_latency[slot];
        if requested < floor {
            log::warn!(
                "[BeatClock] Latency at position {} clamped from {} us to {} us",
                slot,
                requested,
                floor
            );
            self.telemetry
                .record_clamp(ClampTarget::Latency { position: slot }, requested, floor);
            self.pending_latency[slot] = floor;
        }
    }

    /// Perform the tick scheduled for `now` and return what follows.
    pub fn on_tick(&mut self, now: Micros) -> ClockEffect {
        if !self.is_running() {
            return ClockEffect::default();
        }
        if self.start_pending {
            self.start_pending = false;
            self.midi.send(START);
        }

        let mut detector = None;
        match self.tick {
            ACCENT_TICK => {
                let (tau, position) = {
                    let snapshot = self.state.snapshot();
                    (snapshot.tau, snapshot.bar_position)
                };
                let latency = std::mem::take(&mut self.pending_latency[position]);
                self.tick_interval = div_round(tau + latency, TICKS_PER_8TH as Micros).max(1);
                if position % 2 == 0 {
                    self.indicators.accent_on(((position % 8) / 2) as u8);
                }
            }
            ACCENT_OFF_TICK => self.indicators.accents_off(),
            WINDOW_CLOSE_TICK => detector = Some(DetectorCommand::DisallowAndStartSync),
            HALF_BEAT_TICK => {
                let sync = std::mem::take(&mut self.pending_sync);
                let half_period = self.state.update(|state| {
                    let half_period = (div_round(state.tau, 2) + sync).max(1);
                    state.expected_beat = now + half_period;
                    state.advance_position();
                    half_period
                });
                let half_ticks = (TICKS_PER_8TH - HALF_BEAT_TICK) as Micros;
                self.tick_interval = div_round(half_period, half_ticks).max(1);
            }
            WINDOW_OPEN_TICK => detector = Some(DetectorCommand::Allow),
            _ => {}
        }

        self.midi.send(TIMING_CLOCK);
        self.tick = (self.tick + 1) % TICKS_PER_8TH;

        ClockEffect {
            detector,
            next_tick_at: Some(now + self.tick_interval),
        }
    }
}
