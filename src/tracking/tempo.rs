// TempoController - tempo tracking from inter-onset intervals
//
// After every sync pass the newest onset is paired with each older onset of
// the last two bars. Each interval is measured in tatums (v = round(IOI/tau))
// and scored by how close it lands to that multiple and how musically likely
// the multiple is (weight table). The best-scoring interval drives the tempo
// correction `alpha * accuracy * error / v`.

use super::{
    gaussian, sigma_floor, SIGMA_WEIGHT_SHARE, THETA_RELAX_FACTOR, THETA_TIGHTEN_MARGIN,
    THETA_TIGHTEN_RATE,
};
use crate::config::{TempoConfig, MAX_IOI_MULTIPLE};
use crate::onset::OnsetLog;
use crate::state::{BeatSnapshot, Micros, TWO_BAR_LENGTH};

/// Best interval of a tempo pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoWinner {
    /// `IOI - v * tau`
    pub error: f64,
    /// Interval length in tatums
    pub v: usize,
    pub accuracy: f64,
}

/// Result of one tempo pass
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TempoOutcome {
    /// Correction to send to the clock (outside the deadband)
    pub correction: Option<Micros>,
    /// Correction computed for an accepted winner, sent or not
    pub computed: Option<f64>,
    pub winner: Option<TempoWinner>,
    /// Set when an interval beyond two bars stopped the scan
    pub aborted_at: Option<i64>,
    /// Cursor position after dropping onsets older than two bars
    pub tempo_cursor: u64,
}

/// Drop onsets older than two bars from the tempo window.
///
/// Returns the new cursor, which never moves past `newest`.
pub fn advance_cursor(cursor: u64, newest: u64, log: &OnsetLog, tau: Micros, now: Micros) -> u64 {
    let horizon = now - tau * TWO_BAR_LENGTH as Micros;
    let mut cursor = log.clamp_cursor(cursor);
    while cursor < newest {
        match log.get(cursor) {
            Some(onset) if onset.timestamp_us >= horizon => break,
            _ => cursor += 1,
        }
    }
    cursor
}

/// Adaptive tempo evaluator state. Persists across passes.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoController {
    sigma: f64,
    theta: f64,
}

impl TempoController {
    pub fn new(tau: Micros, config: &TempoConfig) -> Self {
        let mut controller = Self {
            sigma: 1.0,
            theta: config.initial_theta,
        };
        controller.reset(tau, config);
        controller
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    /// Restore the tau-scaled defaults for a new performance
    pub fn reset(&mut self, tau: Micros, config: &TempoConfig) {
        self.sigma = sigma_floor(tau, config.sigma_width_factor);
        self.theta = config.initial_theta;
    }

    /// Score the intervals ending at the newest onset.
    pub fn evaluate(
        &mut self,
        snapshot: &BeatSnapshot,
        log: &OnsetLog,
        config: &TempoConfig,
        now: Micros,
    ) -> TempoOutcome {
        let newest = match snapshot.newest_onset {
            Some(newest) if snapshot.onset_observed => newest,
            _ => {
                return TempoOutcome {
                    tempo_cursor: snapshot.tempo_cursor,
                    ..TempoOutcome::default()
                }
            }
        };
        let Some(newest_onset) = log.get(newest) else {
            return TempoOutcome {
                tempo_cursor: snapshot.tempo_cursor,
                ..TempoOutcome::default()
            };
        };

        let tau = snapshot.tau.max(1);
        let cursor = advance_cursor(snapshot.tempo_cursor, newest, log, tau, now);
        let floor = sigma_floor(tau, config.sigma_width_factor);
        self.sigma = self.sigma.max(floor);

        let mut best: Option<TempoWinner> = None;
        let mut best_v = 0;
        let mut aborted_at = None;

        for (_, onset) in log.range(cursor, newest) {
            let ioi = (newest_onset.timestamp_us - onset.timestamp_us) as f64;
            let v = (ioi / tau as f64).round() as i64;
            if v > MAX_IOI_MULTIPLE as i64 {
                aborted_at = Some(v);
                break;
            }
            if v <= 0 {
                // Simultaneous hits carry no tempo information
                continue;
            }
            let v = v as usize;
            let error = ioi - (v as Micros * tau) as f64;
            let accuracy = gaussian(error, self.sigma) * config.weights[v];
            let replaces = match best {
                None => accuracy > 0.0,
                Some(current) => {
                    accuracy > current.accuracy
                        || (accuracy == current.accuracy && v < current.v)
                }
            };
            if replaces {
                best = Some(TempoWinner { error, v, accuracy });
                best_v = v;
            }
        }

        if aborted_at.is_some() {
            best = None;
        }
        let accuracy = best.map_or(0.0, |winner| winner.accuracy);

        let mut correction = None;
        let mut computed = None;
        match best {
            Some(winner) if winner.accuracy >= self.theta => {
                let value = config.alpha * winner.accuracy * (winner.error / winner.v as f64);
                computed = Some(value);
                let rounded = value.round() as Micros;
                if rounded.abs() >= config.deadband_us {
                    correction = Some(rounded);
                }
                if winner.accuracy >= self.theta + config.headroom {
                    self.theta +=
                        THETA_TIGHTEN_RATE * (winner.accuracy - self.theta - THETA_TIGHTEN_MARGIN);
                }
            }
            _ => self.theta *= THETA_RELAX_FACTOR,
        }

        self.sigma = (self.sigma * (1.0 + SIGMA_WEIGHT_SHARE * config.weights[best_v] - accuracy))
            .max(floor);

        TempoOutcome {
            correction,
            computed,
            winner: best,
            aborted_at,
            tempo_cursor: cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onset::{Instrument, OnsetEvent};
    use crate::state::BeatClockState;

    const TAU: Micros = 250_000;

    fn push(log: &OnsetLog, t: Micros) {
        log.push(OnsetEvent {
            timestamp_us: t,
            instrument: Instrument::Kick,
        });
    }

    fn snapshot(log: &OnsetLog) -> BeatSnapshot {
        let mut state = BeatClockState::new(TAU);
        state.newest_onset = log.newest();
        state.onset_observed = true;
        state.snapshot()
    }

    #[test]
    fn test_reset_defaults_and_idempotence() {
        let config = TempoConfig::default();
        let mut controller = TempoController::new(TAU, &config);
        assert_eq!(controller.sigma(), 12_500.0);
        assert_eq!(controller.theta(), 0.8);

        controller.reset(TAU, &config);
        let once = controller.clone();
        controller.reset(TAU, &config);
        assert_eq!(controller, once);
    }

    #[test]
    fn test_no_onset_is_noop() {
        let config = TempoConfig::default();
        let mut controller = TempoController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_000);
        let mut snap = snapshot(&log);
        snap.onset_observed = false;

        let outcome = controller.evaluate(&snap, &log, &config, 2_000);
        assert_eq!(outcome, TempoOutcome::default());
        assert_eq!(controller.theta(), 0.8);
    }

    #[test]
    fn test_large_drift_falls_outside_window() {
        let config = TempoConfig::default();
        let mut controller = TempoController::new(TAU, &config);
        let log = OnsetLog::new();
        // Quarter notes played 4% slow
        for i in 0..4 {
            push(&log, 1_000_000 + i * 520_000);
        }
        let outcome = controller.evaluate(&snapshot(&log), &log, &config, 2_600_000);
        let winner = outcome.winner.expect("winner");
        assert_eq!(winner.v, 2);
        assert_eq!(winner.error, 20_000.0);
        // 20 ms error is well outside the 12.5 ms window, so the match stays below theta
        assert!(winner.accuracy < 0.8);
        assert_eq!(outcome.correction, None);
        assert!((controller.theta() - 0.48).abs() < 1e-9);
    }

    #[test]
    fn test_small_drift_is_corrected() {
        let config = TempoConfig::default();
        let mut controller = TempoController::new(TAU, &config);
        let log = OnsetLog::new();
        for i in 0..4 {
            push(&log, 1_000_000 + i * 504_000);
        }
        let outcome = controller.evaluate(&snapshot(&log), &log, &config, 2_600_000);
        let winner = outcome.winner.expect("winner");
        assert_eq!(winner.v, 2);
        let correction = outcome.correction.expect("outside deadband");
        assert!(correction > 1_500 && correction <= 2_000, "correction {}", correction);
    }

    #[test]
    fn test_interval_beyond_two_bars_aborts() {
        let config = TempoConfig::default();
        let mut controller = TempoController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 0);
        push(&log, 17 * TAU);

        // An evaluation time that still keeps the first onset inside the horizon
        let outcome = controller.evaluate(&snapshot(&log), &log, &config, 16 * TAU);
        assert_eq!(outcome.aborted_at, Some(17));
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.correction, None);
        assert!((controller.theta() - 0.48).abs() < 1e-9);
    }

    #[test]
    fn test_cursor_drops_old_onsets_but_not_newest() {
        let log = OnsetLog::new();
        push(&log, 0);
        push(&log, 100_000);
        push(&log, 5_000_000);

        let now = 5_000_000;
        // Horizon is now - 16 * tau = 1_000_000
        assert_eq!(advance_cursor(0, 2, &log, TAU, now), 2);
        // Horizon 50_000 drops only the onset at 0
        assert_eq!(advance_cursor(0, 2, &log, TAU, 4_050_000), 1);
        assert_eq!(advance_cursor(0, 2, &log, TAU, 100_000), 0);
    }

    #[test]
    fn test_identical_timestamps_are_skipped() {
        let config = TempoConfig::default();
        let mut controller = TempoController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_000_000);
        push(&log, 1_000_000);

        let outcome = controller.evaluate(&snapshot(&log), &log, &config, 1_000_000);
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.aborted_at, None);
    }
}
