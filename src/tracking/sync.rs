// SyncController - phase alignment of the clock to the performer
//
// Once per 8th note, after the clock closes the logging window, every onset
// logged in the window is compared with the expected beat. The best match
// produces a phase correction for the next half beat.
//
// Metrical layers keep the clock from locking onto weak subdivisions: once a
// beat on layer L has been synced, onsets on lower layers only win when they
// beat the accuracy of that sync. The synced layer decays again when the
// performer leaves that layer silent.

use serde::{Deserialize, Serialize};

use super::{
    gaussian, sigma_floor, SIGMA_WEIGHT_SHARE, THETA_RELAX_FACTOR, THETA_TIGHTEN_MARGIN,
    THETA_TIGHTEN_RATE,
};
use crate::config::SyncConfig;
use crate::onset::OnsetLog;
use crate::state::{BeatSnapshot, Micros};

/// When a silent beat lowers the synced layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerDecayRule {
    /// Only a silent beat on exactly the synced layer decays it
    #[default]
    Equal,
    /// Any silent beat on the synced layer or above decays it
    AtLeast,
}

impl LayerDecayRule {
    fn applies(self, layer: u8, last_synced_layer: u8) -> bool {
        match self {
            LayerDecayRule::Equal => layer == last_synced_layer,
            LayerDecayRule::AtLeast => layer >= last_synced_layer,
        }
    }
}

/// Result of one sync pass
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SyncOutcome {
    /// Phase correction to send to the clock, if an onset won
    pub correction: Option<Micros>,
    /// Accuracy of the winning onset
    pub winner_accuracy: Option<f64>,
    /// Onsets scored in this pass
    pub evaluated: usize,
    /// The synced layer was lowered because the beat stayed silent
    pub layer_decayed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    accuracy: f64,
    correction: f64,
}

/// Adaptive phase evaluator state. Persists across passes.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncController {
    sigma: f64,
    theta: f64,
    last_synced_layer: u8,
    accuracy_of_last_synced_layer: f64,
    decay_rule: LayerDecayRule,
}

impl SyncController {
    pub fn new(tau: Micros, config: &SyncConfig) -> Self {
        let mut controller = Self {
            sigma: 1.0,
            theta: config.initial_theta,
            last_synced_layer: 0,
            accuracy_of_last_synced_layer: 0.0,
            decay_rule: LayerDecayRule::default(),
        };
        controller.reset(tau, config);
        controller
    }

    pub fn with_decay_rule(mut self, rule: LayerDecayRule) -> Self {
        self.decay_rule = rule;
        self
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn last_synced_layer(&self) -> u8 {
        self.last_synced_layer
    }

    pub fn accuracy_of_last_synced_layer(&self) -> f64 {
        self.accuracy_of_last_synced_layer
    }

    /// Restore the tau-scaled defaults for a new performance
    pub fn reset(&mut self, tau: Micros, config: &SyncConfig) {
        self.sigma = sigma_floor(tau, config.sigma_width_factor);
        self.theta = config.initial_theta;
        self.last_synced_layer = 0;
        self.accuracy_of_last_synced_layer = 0.0;
    }

    /// Score the onsets of the window that just closed.
    pub fn evaluate(
        &mut self,
        snapshot: &BeatSnapshot,
        log: &OnsetLog,
        config: &SyncConfig,
    ) -> SyncOutcome {
        let layer = snapshot.layer;

        let newest = match snapshot.newest_onset {
            Some(newest) if snapshot.onset_observed => newest,
            _ => {
                let layer_decayed = self.decay_rule.applies(layer, self.last_synced_layer)
                    && self.last_synced_layer > 1;
                if layer_decayed {
                    self.last_synced_layer -= 1;
                }
                return SyncOutcome {
                    layer_decayed,
                    ..SyncOutcome::default()
                };
            }
        };

        let floor = sigma_floor(snapshot.tau, config.sigma_width_factor);
        // Every onset of the window is scored against the same width; sigma
        // adapted below only applies from the next pass on
        self.sigma = self.sigma.max(floor);
        let window_sigma = self.sigma;
        let mut winner: Option<Candidate> = None;
        let mut evaluated = 0;

        for (_, onset) in log.range(snapshot.sync_cursor, newest + 1) {
            evaluated += 1;

            let weight = config.weights[onset.instrument.index()][snapshot.bar_position];
            let error = (onset.timestamp_us - snapshot.expected_beat) as f64;
            let g = gaussian(error, window_sigma);
            let accuracy = g * weight;
            let dominant = layer >= self.last_synced_layer;

            if accuracy > self.theta {
                if dominant || accuracy > self.accuracy_of_last_synced_layer {
                    let better = winner.map_or(true, |best| accuracy > best.accuracy);
                    if better {
                        winner = Some(Candidate {
                            accuracy,
                            correction: ((g + config.beta) / (config.beta + 1.0)) * accuracy * error,
                        });
                    }
                }
                if dominant && accuracy >= self.theta + config.headroom {
                    self.theta += THETA_TIGHTEN_RATE * (accuracy - self.theta - THETA_TIGHTEN_MARGIN);
                    self.sigma = (self.sigma
                        * (config.narrow_ratio + SIGMA_WEIGHT_SHARE * weight - accuracy))
                        .max(floor);
                }
            } else if dominant {
                self.theta *= THETA_RELAX_FACTOR;
                self.sigma = (self.sigma
                    * (config.expand_ratio + SIGMA_WEIGHT_SHARE * weight - accuracy))
                    .max(floor);
            }
        }

        let Some(best) = winner else {
            return SyncOutcome {
                evaluated,
                ..SyncOutcome::default()
            };
        };

        if layer >= self.last_synced_layer {
            self.last_synced_layer = layer;
            self.accuracy_of_last_synced_layer = best.accuracy;
        }

        SyncOutcome {
            correction: Some(best.correction.round() as Micros),
            winner_accuracy: Some(best.accuracy),
            evaluated,
            layer_decayed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onset::{Instrument, OnsetEvent};
    use crate::state::{BeatClockState, LAYER_OF};

    const TAU: Micros = 250_000;

    fn snapshot_at(position: usize, expected_beat: Micros, log: &OnsetLog) -> BeatSnapshot {
        let mut state = BeatClockState::new(TAU);
        state.bar_position = position;
        state.layer = LAYER_OF[position];
        state.expected_beat = expected_beat;
        state.newest_onset = log.newest();
        state.onset_observed = !log.is_empty();
        state.snapshot()
    }

    fn silent(layer: u8) -> BeatSnapshot {
        let mut state = BeatClockState::new(TAU);
        state.layer = layer;
        state.snapshot()
    }

    fn push(log: &OnsetLog, t: Micros, instrument: Instrument) {
        log.push(OnsetEvent {
            timestamp_us: t,
            instrument,
        });
    }

    #[test]
    fn test_reset_defaults_and_idempotence() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        assert_eq!(controller.sigma(), 25_000.0);
        assert_eq!(controller.theta(), 0.8);

        controller.reset(TAU, &config);
        let once = controller.clone();
        controller.reset(TAU, &config);
        assert_eq!(controller, once);
    }

    #[test]
    fn test_late_onset_gives_positive_correction() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_000_050, Instrument::Kick);

        let outcome = controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        let correction = outcome.correction.expect("onset should win");
        assert!(correction > 0);
        assert!((49..=50).contains(&correction), "correction {}", correction);
        assert_eq!(controller.last_synced_layer(), 3);
    }

    #[test]
    fn test_early_onset_gives_negative_correction() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 998_000, Instrument::Snare);

        let outcome = controller.evaluate(&snapshot_at(4, 1_000_000, &log), &log, &config);
        assert!(outcome.correction.unwrap() < 0);
    }

    #[test]
    fn test_confident_match_tightens() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_000_000, Instrument::Kick);

        controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        // accuracy 1.0: theta moves by 0.3 * (1.0 - 0.8 - 0.1)
        assert!((controller.theta() - 0.83).abs() < 1e-9);
        // narrow factor 1.0 + 0.7 - 1.0 shrinks sigma, which then sits on the floor
        assert_eq!(controller.sigma(), 25_000.0);
    }

    #[test]
    fn test_miss_relaxes_and_widens() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        // Far outside the window: essentially zero acceptance
        push(&log, 1_000_000 + 100_000, Instrument::Kick);

        let outcome = controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        assert_eq!(outcome.correction, None);
        assert_eq!(outcome.evaluated, 1);
        assert!((controller.theta() - 0.48).abs() < 1e-9);
        assert!(controller.sigma() > 25_000.0);
    }

    #[test]
    fn test_weak_position_onset_does_not_win() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_000_000, Instrument::Kick);

        // Position 1 weighs 0.1, below theta
        let outcome = controller.evaluate(&snapshot_at(1, 1_000_000, &log), &log, &config);
        assert_eq!(outcome.correction, None);
    }

    #[test]
    fn test_best_onset_wins() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_004_000, Instrument::Kick);
        push(&log, 1_001_000, Instrument::Snare);

        let outcome = controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        assert_eq!(outcome.evaluated, 2);
        let correction = outcome.correction.unwrap();
        assert!(correction > 900 && correction <= 1_000, "correction {}", correction);
    }

    #[test]
    fn test_lower_layer_needs_better_accuracy() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);

        let log = OnsetLog::new();
        push(&log, 1_000_000, Instrument::Kick);
        controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        assert_eq!(controller.last_synced_layer(), 3);
        let synced_accuracy = controller.accuracy_of_last_synced_layer();
        assert!((synced_accuracy - 1.0).abs() < 1e-9);

        // Position 2 sits on layer 1: a decent but imperfect hit does not win
        let before = controller.clone();
        push(&log, 1_500_000 + 5_000, Instrument::Kick);
        let mut snapshot = snapshot_at(2, 1_500_000, &log);
        snapshot.sync_cursor = 1;
        let outcome = controller.evaluate(&snapshot, &log, &config);
        assert_eq!(outcome.correction, None);
        // Lower-layer onsets leave the adaptive parameters alone
        assert_eq!(controller.theta(), before.theta());
        assert_eq!(controller.last_synced_layer(), 3);
    }

    #[test]
    fn test_window_scored_with_sigma_from_pass_start() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        // A miss widens sigma, the following hit is still judged at 25 ms
        push(&log, 1_100_000, Instrument::Kick);
        push(&log, 1_020_000, Instrument::Kick);

        let outcome = controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        assert_eq!(outcome.evaluated, 2);
        assert_eq!(outcome.correction, Some(12_037));
        let accuracy = outcome.winner_accuracy.unwrap();
        assert!((accuracy - 0.726_149).abs() < 1e-6, "accuracy {}", accuracy);

        // The widened sigma carries over to the next pass
        assert!((controller.sigma() - 41_380.5).abs() < 1.0, "sigma {}", controller.sigma());
        assert!((controller.theta() - 0.523_845).abs() < 1e-6);
    }

    #[test]
    fn test_lower_layer_wins_with_better_accuracy() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);

        // Layer 3 synced with an accuracy of about 0.855, below the headroom
        let log = OnsetLog::new();
        push(&log, 1_014_000, Instrument::Kick);
        let outcome = controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        assert!(outcome.correction.is_some());
        assert_eq!(controller.last_synced_layer(), 3);
        let synced_accuracy = controller.accuracy_of_last_synced_layer();
        assert!((synced_accuracy - 0.854_875).abs() < 1e-6);
        let before = controller.clone();

        // A near-exact hit on layer 1 beats that accuracy and wins
        push(&log, 1_502_000, Instrument::Kick);
        let mut snapshot = snapshot_at(2, 1_500_000, &log);
        snapshot.sync_cursor = 1;
        let outcome = controller.evaluate(&snapshot, &log, &config);
        assert_eq!(outcome.correction, Some(1_990));

        // Lower-layer wins leave the adaptive parameters alone
        assert_eq!(controller.theta(), before.theta());
        assert_eq!(controller.sigma(), before.sigma());
        assert_eq!(controller.last_synced_layer(), 3);
        assert_eq!(controller.accuracy_of_last_synced_layer(), synced_accuracy);
    }

    #[test]
    fn test_layer_decays_to_one_and_stops() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_000_000, Instrument::Kick);
        controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);
        assert_eq!(controller.last_synced_layer(), 3);

        let mut seen = vec![controller.last_synced_layer()];
        for layer in [3, 2, 1] {
            controller.evaluate(&silent(layer), &log, &config);
            seen.push(controller.last_synced_layer());
        }
        assert_eq!(seen, vec![3, 2, 1, 1]);
    }

    #[test]
    fn test_equal_rule_ignores_other_layers() {
        let config = SyncConfig::default();
        let mut controller = SyncController::new(TAU, &config);
        let log = OnsetLog::new();
        push(&log, 1_000_000, Instrument::Kick);
        controller.evaluate(&snapshot_at(0, 1_000_000, &log), &log, &config);

        // Silent beats on other layers leave the synced layer at 3
        for layer in [0, 1, 2, 0] {
            let outcome = controller.evaluate(&silent(layer), &log, &config);
            assert!(!outcome.layer_decayed);
        }
        assert_eq!(controller.last_synced_layer(), 3);
    }

    #[test]
    fn test_at_least_rule_decays_from_higher_layers() {
        let config = SyncConfig::default();
        let mut controller =
            SyncController::new(TAU, &config).with_decay_rule(LayerDecayRule::AtLeast);
        let log = OnsetLog::new();
        push(&log, 1_000_000, Instrument::Kick);
        controller.evaluate(&snapshot_at(8, 1_000_000, &log), &log, &config);
        assert_eq!(controller.last_synced_layer(), 3);

        let mut seen = Vec::new();
        for _ in 0..4 {
            controller.evaluate(&silent(3), &log, &config);
            seen.push(controller.last_synced_layer());
        }
        assert_eq!(seen, vec![2, 1, 1, 1]);
    }
}
