//! Shared runtime state of the beat clock.
//!
//! One `BeatClockState` exists per tracker. It is protected by a single mutex
//! and every access follows the snapshot-read / critical-write discipline:
//! lock, copy what is needed, unlock, compute, and re-lock only to write back.

use std::sync::{Arc, Mutex, MutexGuard};

/// Microseconds on the tracker's monotonic clock.
pub type Micros = i64;

/// Number of 8th notes in two bars of 4/4.
pub const TWO_BAR_LENGTH: usize = 16;

/// Metrical tier of every 8th-note position across two bars.
///
/// Downbeats of each bar weigh most, then the backbeat, then the remaining
/// quarter notes; off-beat 8ths sit on tier 0.
pub const LAYER_OF: [u8; TWO_BAR_LENGTH] = [3, 0, 1, 0, 2, 0, 1, 0, 3, 0, 1, 0, 2, 0, 1, 0];

/// Mutable timing state shared by the detector, the clock and the evaluators.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatClockState {
    /// Duration of one 8th note
    pub tau: Micros,
    /// Position within two bars, `0..16`
    pub bar_position: usize,
    /// `LAYER_OF[bar_position]`
    pub layer: u8,
    /// Absolute time of the next 8th-note boundary
    pub expected_beat: Micros,
    /// Whether an onset was detected during the last logging window
    pub onset_observed: bool,
    /// Sequence number of the newest logged onset, if any
    pub newest_onset: Option<u64>,
    /// First onset sequence the sync evaluator looks at
    pub sync_cursor: u64,
    /// First onset sequence the tempo evaluator looks at
    pub tempo_cursor: u64,
}

impl BeatClockState {
    pub fn new(tau: Micros) -> Self {
        Self {
            tau: tau.max(1),
            bar_position: 0,
            layer: LAYER_OF[0],
            expected_beat: 0,
            onset_observed: false,
            newest_onset: None,
            sync_cursor: 0,
            tempo_cursor: 0,
        }
    }

    /// Reset for a new performance. Tau is preserved.
    ///
    /// Cursors move to the next sequence number the onset log will assign so
    /// that onsets from a previous performance are never evaluated again.
    pub fn reset_for_performance(&mut self) {
        let next_seq = self.newest_onset.map(|seq| seq + 1).unwrap_or(0);
        self.bar_position = 0;
        self.layer = LAYER_OF[0];
        self.onset_observed = false;
        self.sync_cursor = next_seq;
        self.tempo_cursor = next_seq;
    }

    /// Advance to the next 8th-note position.
    pub fn advance_position(&mut self) {
        self.bar_position = (self.bar_position + 1) % TWO_BAR_LENGTH;
        self.layer = LAYER_OF[self.bar_position];
    }

    pub fn snapshot(&self) -> BeatSnapshot {
        BeatSnapshot {
            tau: self.tau,
            bar_position: self.bar_position,
            layer: self.layer,
            expected_beat: self.expected_beat,
            onset_observed: self.onset_observed,
            newest_onset: self.newest_onset,
            sync_cursor: self.sync_cursor,
            tempo_cursor: self.tempo_cursor,
        }
    }
}

/// Read-only copy of [`BeatClockState`] taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatSnapshot {
    pub tau: Micros,
    pub bar_position: usize,
    pub layer: u8,
    pub expected_beat: Micros,
    pub onset_observed: bool,
    pub newest_onset: Option<u64>,
    pub sync_cursor: u64,
    pub tempo_cursor: u64,
}

/// Cloneable handle to the single shared [`BeatClockState`].
#[derive(Debug, Clone)]
pub struct SharedBeatState {
    inner: Arc<Mutex<BeatClockState>>,
}

impl SharedBeatState {
    pub fn new(tau: Micros) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BeatClockState::new(tau))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BeatClockState> {
        // A panicking writer cannot leave the plain-data state half-updated in
        // a way that breaks the invariants below, so keep running on poison.
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::error!("[BeatState] lock poisoned, recovering state");
            poisoned.into_inner()
        })
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> BeatSnapshot {
        self.lock().snapshot()
    }

    /// Run a short critical section that writes results back.
    pub fn update<R>(&self, f: impl FnOnce(&mut BeatClockState) -> R) -> R {
        let mut guard = self.lock();
        let result = f(&mut guard);
        debug_assert!(guard.tau > 0, "tau must stay positive");
        debug_assert!(guard.bar_position < TWO_BAR_LENGTH);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_table_downbeats_highest() {
        assert_eq!(LAYER_OF[0], 3);
        assert_eq!(LAYER_OF[8], 3);
        assert_eq!(LAYER_OF[4], 2);
        assert!(LAYER_OF.iter().all(|&layer| layer <= 3));
        assert!(LAYER_OF.iter().skip(1).step_by(2).all(|&layer| layer == 0));
    }

    #[test]
    fn test_new_state_is_valid() {
        let state = BeatClockState::new(250_000);
        assert_eq!(state.tau, 250_000);
        assert_eq!(state.layer, 3);
        assert_eq!(state.newest_onset, None);

        let clamped = BeatClockState::new(0);
        assert_eq!(clamped.tau, 1);
    }

    #[test]
    fn test_advance_wraps_after_two_bars() {
        let mut state = BeatClockState::new(250_000);
        for _ in 0..TWO_BAR_LENGTH {
            state.advance_position();
        }
        assert_eq!(state.bar_position, 0);
        assert_eq!(state.layer, 3);

        state.advance_position();
        assert_eq!(state.bar_position, 1);
        assert_eq!(state.layer, 0);
    }

    #[test]
    fn test_reset_preserves_tau_and_skips_old_onsets() {
        let mut state = BeatClockState::new(200_000);
        state.bar_position = 7;
        state.layer = 0;
        state.onset_observed = true;
        state.newest_onset = Some(41);
        state.reset_for_performance();

        assert_eq!(state.tau, 200_000);
        assert_eq!(state.bar_position, 0);
        assert_eq!(state.layer, 3);
        assert!(!state.onset_observed);
        assert_eq!(state.sync_cursor, 42);
        assert_eq!(state.tempo_cursor, 42);
    }

    #[test]
    fn test_shared_update_and_snapshot() {
        let shared = SharedBeatState::new(250_000);
        let clone = shared.clone();
        clone.update(|state| state.expected_beat = 1_000);
        assert_eq!(shared.snapshot().expected_beat, 1_000);
    }
}
