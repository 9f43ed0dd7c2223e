// Tracking module - adaptive phase and tempo evaluators
//
// Both evaluators score recent onsets with a Gaussian acceptance window:
//
//   gaussian = exp(error^2 / (-2 * sigma^2))
//   accuracy = gaussian * weight
//
// and adapt `sigma` (window width) and `theta` (acceptance threshold) after
// every pass: confident matches raise theta and narrow the window, misses
// lower theta and widen it. Sigma never drops below `tau / width_factor`.
//
// Architecture:
// - SyncController: phase error of onsets against the expected beat
// - TempoController: inter-onset intervals against multiples of tau
// - worker: tokio tasks woken by single-slot signals, run in one thread

pub mod signal;
pub mod sync;
pub mod tempo;
pub mod worker;

pub use signal::{EvaluatorSignal, EvaluatorWake, WakeListener};
pub use sync::{LayerDecayRule, SyncController, SyncOutcome};
pub use tempo::{TempoController, TempoOutcome, TempoWinner};
pub use worker::{
    spawn_evaluator_thread, sync_pass, tempo_pass, EvaluatorHandle, EvaluatorLinks,
};

use crate::state::Micros;

/// Margin subtracted from the accuracy surplus when tightening theta
pub(crate) const THETA_TIGHTEN_MARGIN: f64 = 0.1;
/// Share of the surplus theta moves up by when tightening
pub(crate) const THETA_TIGHTEN_RATE: f64 = 0.3;
/// Factor theta is multiplied by after a miss
pub(crate) const THETA_RELAX_FACTOR: f64 = 0.6;
/// Weight share in the sigma update factor
pub(crate) const SIGMA_WEIGHT_SHARE: f64 = 0.7;

/// Smallest sigma allowed for `tau`: `max(1, round(tau / width_factor))`.
pub fn sigma_floor(tau: Micros, width_factor: u32) -> f64 {
    (tau as f64 / width_factor.max(1) as f64).round().max(1.0)
}

/// Gaussian acceptance of `error` for window `sigma`, always within `[0, 1]`.
///
/// A sigma below 1 (including zero or NaN) is treated as 1.
pub fn gaussian(error: f64, sigma: f64) -> f64 {
    let sigma = if sigma >= 1.0 { sigma } else { 1.0 };
    let value = (error * error / (-2.0 * sigma * sigma)).exp();
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_range() {
        for &error in &[0.0, 1.0, -1.0, 50.0, -25_000.0, 1e9, -1e150, f64::MAX] {
            for &sigma in &[1.0, 60.0, 12_500.0, 1e6] {
                let g = gaussian(error, sigma);
                assert!((0.0..=1.0).contains(&g), "gaussian({}, {}) = {}", error, sigma, g);
            }
        }
        assert_eq!(gaussian(0.0, 100.0), 1.0);
    }

    #[test]
    fn test_gaussian_guards_degenerate_sigma() {
        // Zero sigma must not divide by zero
        let g = gaussian(0.5, 0.0);
        assert!(g.is_finite());
        assert_eq!(g, gaussian(0.5, 1.0));
        assert_eq!(gaussian(3.0, f64::NAN), gaussian(3.0, 1.0));
        assert_eq!(gaussian(3.0, -5.0), gaussian(3.0, 1.0));
    }

    #[test]
    fn test_gaussian_is_symmetric_and_decreasing() {
        assert_eq!(gaussian(100.0, 50.0), gaussian(-100.0, 50.0));
        assert!(gaussian(10.0, 50.0) > gaussian(20.0, 50.0));
    }

    #[test]
    fn test_sigma_floor() {
        assert_eq!(sigma_floor(250_000, 10), 25_000.0);
        assert_eq!(sigma_floor(250_000, 20), 12_500.0);
        assert_eq!(sigma_floor(5, 20), 1.0);
        assert_eq!(sigma_floor(250_000, 0), 250_000.0);
    }
}
