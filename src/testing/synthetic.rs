//! Synthetic piezo performances.
//!
//! Generates a two-channel recording of a basic rock groove (kick on beats 1
//! and 3, snare on 2 and 4) at the detector frame rate. The tempo can ramp
//! linearly over the performance and every hit can be shifted by seeded
//! random jitter, so a given spec always renders the same recording.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::tau_from_bpm;
use crate::onset::Instrument;
use crate::replay::Recording;
use crate::state::Micros;

/// Peak level of a rendered hit
pub const HIT_LEVEL: u16 = 3_000;
/// Frames a rendered hit stays at its peak
const HIT_FRAMES: usize = 3;
/// 8th-note positions of each bar that carry a hit
const GROOVE: [(usize, Instrument); 4] = [
    (0, Instrument::Kick),
    (2, Instrument::Snare),
    (4, Instrument::Kick),
    (6, Instrument::Snare),
];

fn default_bpm() -> f64 {
    120.0
}

fn default_bars() -> usize {
    8
}

fn default_lead_in_us() -> Micros {
    100_000
}

fn default_seed() -> u64 {
    0x5EED_B347
}

/// Declarative description of a generated performance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticPerformance {
    /// Starting quarter-note tempo
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    /// Tempo change reached by the last 8th, in percent of `bpm`
    #[serde(default)]
    pub drift_percent: f64,
    #[serde(default = "default_bars")]
    pub bars: usize,
    /// Maximum random displacement of each hit
    #[serde(default)]
    pub jitter_us: Micros,
    /// Silence before the first beat
    #[serde(default = "default_lead_in_us")]
    pub lead_in_us: Micros,
    /// Peak of the uniform background noise on both channels
    #[serde(default)]
    pub noise_floor: u16,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SyntheticPerformance {
    fn default() -> Self {
        Self {
            bpm: default_bpm(),
            drift_percent: 0.0,
            bars: default_bars(),
            jitter_us: 0,
            lead_in_us: default_lead_in_us(),
            noise_floor: 0,
            seed: default_seed(),
        }
    }
}

impl SyntheticPerformance {
    /// 8th-note duration at the starting tempo
    pub fn initial_tau(&self) -> Micros {
        tau_from_bpm(self.bpm)
    }

    /// Time of the first beat
    pub fn first_beat_us(&self) -> Micros {
        self.lead_in_us
    }

    /// Start time of every 8th note plus the end of the last one.
    pub fn eighth_times(&self) -> Vec<Micros> {
        let eighths = self.bars * 8;
        let mut times = Vec::with_capacity(eighths + 1);
        let mut at = self.lead_in_us as f64;
        for k in 0..=eighths {
            times.push(at.round() as Micros);
            let progress = k as f64 / eighths.max(1) as f64;
            let bpm = self.bpm * (1.0 + self.drift_percent / 100.0 * progress);
            at += 30_000_000.0 / bpm.max(1.0);
        }
        times
    }

    /// Every hit in time order, jitter applied.
    pub fn hits(&self) -> Vec<(Micros, Instrument)> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let eighths = self.eighth_times();
        let mut hits = Vec::new();
        for bar in 0..self.bars {
            for &(position, instrument) in &GROOVE {
                let mut at = eighths[bar * 8 + position];
                if self.jitter_us > 0 {
                    at += rng.gen_range(-self.jitter_us..=self.jitter_us);
                }
                hits.push((at.max(0), instrument));
            }
        }
        hits
    }

    /// Render at `frame_period_us`, ending two 8ths after the last bar.
    pub fn render(&self, frame_period_us: f64) -> Recording {
        let eighths = self.eighth_times();
        let end = eighths.last().copied().unwrap_or(0) + 2 * self.initial_tau();
        let period = frame_period_us.max(1.0);
        let len = (end as f64 / period).ceil() as usize;

        let mut frames = vec![[0u16; 2]; len];
        if self.noise_floor > 0 {
            // Separate stream so the hit jitter does not depend on the noise
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
            for frame in frames.iter_mut() {
                frame[0] = rng.gen_range(0..=self.noise_floor);
                frame[1] = rng.gen_range(0..=self.noise_floor);
            }
        }
        for (at, instrument) in self.hits() {
            let start = (at as f64 / period).ceil() as usize;
            for frame in frames.iter_mut().skip(start).take(HIT_FRAMES) {
                frame[instrument.index()] = HIT_LEVEL;
            }
        }
        Recording::new(period, frames)
    }
}
